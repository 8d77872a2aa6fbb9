use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::{error::ChatError, types::ConnectionState};

/// Inputs driving the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// Explicit `connect()` call.
    Connect,
    /// Handshake completed.
    Opened,
    /// An open channel closed unexpectedly.
    Lost,
    /// A connection attempt or an open channel failed.
    Failed,
    /// A reconnection attempt was scheduled.
    RetryScheduled,
    /// Reconnection budget spent.
    Exhausted,
    /// Explicit `disconnect()` call.
    Disconnect,
}

/// One observed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionState,
    pub next: ConnectionState,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempts: u32,
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnection attempts scheduled since the channel was last open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Apply a signal. Returns the transition when the state changed.
    pub fn apply(&mut self, signal: TransportSignal) -> Result<Option<Transition>, ChatError> {
        use ConnectionState::*;
        use TransportSignal::*;

        match signal {
            Connect => {
                // connecting/connected/reconnecting already own a live connection task
                if self.state != Disconnected {
                    return Ok(None);
                }
                self.attempts = 0;
                Ok(self.move_to(Connecting))
            }
            Opened => {
                let transition =
                    self.transition_from_any_of(&[Connecting, Reconnecting], Connected, "opened")?;
                self.attempts = 0;
                Ok(transition)
            }
            Lost => self.transition_from_any_of(&[Connected], Reconnecting, "lost"),
            Failed => {
                self.transition_from_any_of(&[Connected, Connecting, Reconnecting], Error, "failed")
            }
            RetryScheduled => {
                let transition =
                    self.transition_from_any_of(&[Error, Reconnecting], Reconnecting, "retry")?;
                self.attempts = self.attempts.saturating_add(1);
                Ok(transition)
            }
            Exhausted => {
                self.transition_from_any_of(&[Reconnecting, Error], Disconnected, "exhausted")
            }
            Disconnect => {
                self.attempts = 0;
                Ok(self.move_to(Disconnected))
            }
        }
    }

    fn move_to(&mut self, next: ConnectionState) -> Option<Transition> {
        if self.state == next {
            return None;
        }
        let previous = self.state;
        self.state = next;
        Some(Transition { previous, next })
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<Option<Transition>, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        Ok(self.move_to(next))
    }
}

type StateObserver = Arc<dyn Fn(Transition) + Send + Sync>;

/// Synchronous observers notified on every connection state transition.
#[derive(Clone, Default)]
pub struct StateObservers {
    next_id: Arc<AtomicU64>,
    observers: Arc<Mutex<Vec<(u64, StateObserver)>>>,
}

impl std::fmt::Debug for StateObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObservers")
            .field("count", &self.len())
            .finish()
    }
}

impl StateObservers {
    /// Register an observer and return its id for [`StateObservers::remove`].
    pub fn add(&self, observer: impl Fn(Transition) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .expect("state observers lock poisoned")
            .push((id, Arc::new(observer)));
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut observers = self.observers.lock().expect("state observers lock poisoned");
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .expect("state observers lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer in registration order.
    ///
    /// Observers run after the registry lock is released, so an observer may
    /// register or remove observers itself.
    pub fn notify(&self, transition: Transition) {
        let snapshot: Vec<StateObserver> = self
            .observers
            .lock()
            .expect("state observers lock poisoned")
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer(transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn apply(sm: &mut ConnectionStateMachine, signal: TransportSignal) -> Option<Transition> {
        sm.apply(signal).expect("transition should be valid")
    }

    #[test]
    fn runs_happy_path_and_recovery() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), Disconnected);

        apply(&mut sm, TransportSignal::Connect);
        assert_eq!(sm.state(), Connecting);
        apply(&mut sm, TransportSignal::Opened);
        assert_eq!(sm.state(), Connected);

        let lost = apply(&mut sm, TransportSignal::Lost).expect("state should change");
        assert_eq!(lost.previous, Connected);
        assert_eq!(lost.next, Reconnecting);

        assert_eq!(apply(&mut sm, TransportSignal::RetryScheduled), None);
        assert_eq!(sm.attempts(), 1);

        apply(&mut sm, TransportSignal::Opened);
        assert_eq!(sm.state(), Connected);
        assert_eq!(sm.attempts(), 0);
    }

    #[test]
    fn treats_connect_as_noop_when_already_active() {
        let mut sm = ConnectionStateMachine::default();
        apply(&mut sm, TransportSignal::Connect);
        assert_eq!(apply(&mut sm, TransportSignal::Connect), None);
        apply(&mut sm, TransportSignal::Opened);
        assert_eq!(apply(&mut sm, TransportSignal::Connect), None);
        assert_eq!(sm.state(), Connected);
    }

    #[test]
    fn failure_routes_through_error_into_reconnecting() {
        let mut sm = ConnectionStateMachine::default();
        apply(&mut sm, TransportSignal::Connect);
        apply(&mut sm, TransportSignal::Failed);
        assert_eq!(sm.state(), Error);

        apply(&mut sm, TransportSignal::RetryScheduled);
        assert_eq!(sm.state(), Reconnecting);

        apply(&mut sm, TransportSignal::Exhausted);
        assert_eq!(sm.state(), Disconnected);
    }

    #[test]
    fn rejects_lost_signal_when_not_connected() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm
            .apply(TransportSignal::Lost)
            .expect_err("lost should fail while disconnected");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn disconnect_is_allowed_from_any_state() {
        for signals in [
            vec![TransportSignal::Connect],
            vec![TransportSignal::Connect, TransportSignal::Opened],
            vec![TransportSignal::Connect, TransportSignal::Failed],
        ] {
            let mut sm = ConnectionStateMachine::default();
            for signal in signals {
                apply(&mut sm, signal);
            }
            apply(&mut sm, TransportSignal::Disconnect);
            assert_eq!(sm.state(), Disconnected);
        }
    }

    #[test]
    fn notifies_observers_with_previous_and_next_state() {
        let observers = StateObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = observers.add(move |transition| {
            sink.lock().expect("lock").push(transition);
        });

        let transition = Transition {
            previous: Connecting,
            next: Connected,
        };
        observers.notify(transition);
        assert!(observers.remove(id));
        observers.notify(transition);

        assert_eq!(*seen.lock().expect("lock"), vec![transition]);
        assert!(observers.is_empty());
    }
}
