use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::types::{InboundEvent, InboundEventKind};

type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
type HandlerMap = HashMap<InboundEventKind, Vec<(u64, Handler)>>;

/// Per-kind registry of inbound event handlers.
#[derive(Clone, Default)]
pub struct EventHandlers {
    next_id: Arc<AtomicU64>,
    handlers: Arc<Mutex<HandlerMap>>,
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("count", &self.len())
            .finish()
    }
}

/// Disposer returned by [`EventHandlers::subscribe`].
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    kind: InboundEventKind,
    id: u64,
    registry: Weak<Mutex<HandlerMap>>,
}

impl Subscription {
    pub fn kind(&self) -> InboundEventKind {
        self.kind
    }

    /// Remove the handler. Returns `false` when it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut handlers = registry.lock().expect("event handlers lock poisoned");
        let Some(list) = handlers.get_mut(&self.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        list.len() != before
    }
}

impl EventHandlers {
    pub fn subscribe(
        &self,
        kind: InboundEventKind,
        handler: impl Fn(&InboundEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .expect("event handlers lock poisoned")
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.handlers),
        }
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        let snapshot: Vec<Handler> = self
            .handlers
            .lock()
            .expect("event handlers lock poisoned")
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .expect("event handlers lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .expect("event handlers lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
