//! Chat runtime task.
//!
//! One task owns the [`DeliveryCoordinator`] and multiplexes presentation
//! commands, inbound real-time events, connection state changes and the
//! pending request/response send. Every list mutation happens here.

use std::{future, sync::Arc};

use chat_core::{
    ChatApi, ChatChannelError, ChatChannels, ChatCommand, ChatErrorCategory, ChatEvent,
    ConnectionState, DeliveryConfig, DeliveryCoordinator, Dispatch, EventEmitter, EventStream,
    InboundEvent, Notice, RealtimeTransport, RestOutcome, SessionIdentity, Transition,
    create_or_restore,
};
use chat_platform::{ClientStateStore, KeyValueStore};
use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Client persistence as seen by the runtime.
pub type SharedClientState = ClientStateStore<Arc<dyn KeyValueStore>>;

/// Everything the runtime needs, injected by the application.
pub struct RuntimeParts {
    pub api: Arc<dyn ChatApi>,
    /// `None` runs request/response only.
    pub transport: Option<Arc<dyn RealtimeTransport>>,
    pub client_state: Option<SharedClientState>,
    pub delivery: DeliveryConfig,
}

/// Command side of a running runtime. Dropping every clone stops the
/// runtime and disconnects its transport.
#[derive(Debug, Clone)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the runtime. The returned stream is subscribed before the task
/// starts, so it observes `SessionReady`.
pub fn spawn_runtime(parts: RuntimeParts) -> (ChatRuntimeHandle, EventStream) {
    let (channels, command_rx) = ChatChannels::new();
    let events = channels.subscribe();
    let runtime = ChatRuntime::new(channels.emitter(), command_rx, parts);
    tokio::spawn(async move {
        runtime.run().await;
    });

    (ChatRuntimeHandle { channels }, events)
}

/// Last values pushed to subscribers, to emit only changes.
#[derive(Debug, Default)]
struct Published {
    revision: Option<u64>,
    loading: bool,
    error: Option<String>,
    latency: Option<i64>,
}

struct ChatRuntime {
    channels: EventEmitter,
    command_rx: mpsc::Receiver<ChatCommand>,
    api: Arc<dyn ChatApi>,
    transport: Option<Arc<dyn RealtimeTransport>>,
    client_state: Option<SharedClientState>,
    delivery: DeliveryConfig,
    published: Published,
}

impl ChatRuntime {
    fn new(
        channels: EventEmitter,
        command_rx: mpsc::Receiver<ChatCommand>,
        parts: RuntimeParts,
    ) -> Self {
        Self {
            channels,
            command_rx,
            api: parts.api,
            transport: parts.transport,
            client_state: parts.client_state,
            delivery: parts.delivery,
            published: Published::default(),
        }
    }

    async fn run(mut self) {
        let mut inbound = self.transport.as_ref().map(|transport| transport.events());
        let mut transitions = self
            .transport
            .as_ref()
            .map(|transport| transport.transitions());
        let initial_state = self.transport.as_ref().map(|transport| transport.state());
        if let Some(transport) = &self.transport {
            transport.connect();
        }

        let identity = create_or_restore(self.api.as_ref()).await;
        self.remember_session(&identity);
        let mut coordinator = DeliveryCoordinator::new(
            identity.id.as_str(),
            Arc::clone(&self.api),
            self.transport.clone(),
            self.delivery,
        );
        self.channels.emit(ChatEvent::SessionReady {
            session_id: identity.id.to_string(),
            fallback: identity.is_fallback(),
        });

        if let Some(state) = initial_state {
            self.on_state(&mut coordinator, state);
        }
        let _ = coordinator.load_history().await;
        self.publish_updates(&mut coordinator);

        let mut pending: Option<BoxFuture<'static, RestOutcome>> = None;
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("command channel closed; stopping chat runtime");
                        break;
                    };
                    self.handle_command(&mut coordinator, command, &mut pending).await;
                }
                event = next_inbound(&mut inbound) => match event {
                    Ok(event) => coordinator.apply_inbound(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat runtime lagged behind realtime events");
                    }
                    Err(broadcast::error::RecvError::Closed) => inbound = None,
                },
                transition = next_transition(&mut transitions) => match transition {
                    Ok(transition) => self.on_state(&mut coordinator, transition.next),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat runtime lagged behind connection changes");
                        if let Some(transport) = &self.transport {
                            self.on_state(&mut coordinator, transport.state());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => transitions = None,
                },
                outcome = next_outcome(&mut pending) => {
                    pending = None;
                    coordinator.finish_rest_send(outcome);
                }
            }
            self.publish_updates(&mut coordinator);
        }

        if let Some(transport) = &self.transport {
            transport.disconnect();
        }
        info!(session_id = %coordinator.session_id(), "chat runtime stopped");
    }

    async fn handle_command(
        &mut self,
        coordinator: &mut DeliveryCoordinator,
        command: ChatCommand,
        pending: &mut Option<BoxFuture<'static, RestOutcome>>,
    ) {
        match command {
            ChatCommand::Send { content } => {
                let dispatch = coordinator.begin_send(&content);
                self.track_dispatch(coordinator, dispatch, pending);
            }
            ChatCommand::RetryLast => {
                let dispatch = coordinator.retry_last_message();
                self.track_dispatch(coordinator, dispatch, pending);
            }
            ChatCommand::Cancel => {
                if !coordinator.cancel() {
                    debug!("cancel requested with no send in flight");
                }
            }
            ChatCommand::Clear => {
                let route = coordinator.clear_chat().await;
                debug!(?route, "clear requested");
            }
            ChatCommand::ReloadHistory => {
                let _ = coordinator.load_history().await;
            }
            ChatCommand::Ping => {
                if !coordinator.ping() {
                    self.channels
                        .emit(ChatEvent::Notice(Notice::info("Not connected to chat server.")));
                }
            }
        }
    }

    fn track_dispatch(
        &self,
        coordinator: &DeliveryCoordinator,
        dispatch: Result<Dispatch, chat_core::ChatError>,
        pending: &mut Option<BoxFuture<'static, RestOutcome>>,
    ) {
        match dispatch {
            Ok(Dispatch::Realtime { optimistic_id }) => {
                debug!(message_id = %optimistic_id, "send dispatched over realtime channel");
            }
            Ok(Dispatch::Rest(send)) => {
                *pending = Some(coordinator.rest_future(&send));
            }
            // the coordinator already queued the wait notice
            Err(err) if err.category == ChatErrorCategory::Busy => {}
            Err(err) => {
                self.channels
                    .emit(ChatEvent::Notice(Notice::error(err.user_message())));
            }
        }
    }

    fn on_state(&self, coordinator: &mut DeliveryCoordinator, state: ConnectionState) {
        coordinator.on_connection_changed(state);
        self.channels.emit(ChatEvent::ConnectionChanged { state });
    }

    fn remember_session(&self, identity: &SessionIdentity) {
        let Some(client_state) = &self.client_state else {
            return;
        };
        if let Some(previous) = client_state.stored_session_id()
            && previous != identity.id
            && let Err(err) = client_state.clear_session_history(previous.as_str())
        {
            warn!(error = %err, "failed clearing previous session backup");
        }
        if let Err(err) = client_state.store_session_id(&identity.id) {
            warn!(error = %err, "failed persisting session id");
        }
        if let Err(err) = client_state.touch_last_active(Utc::now()) {
            warn!(error = %err, "failed persisting last activity");
        }
    }

    fn publish_updates(&mut self, coordinator: &mut DeliveryCoordinator) {
        let revision = coordinator.revision();
        if self.published.revision != Some(revision) {
            self.published.revision = Some(revision);
            let messages = coordinator.messages().to_vec();
            if let Some(client_state) = &self.client_state
                && let Err(err) =
                    client_state.store_session_history(coordinator.session_id(), &messages)
            {
                warn!(error = %err, "failed writing session backup");
            }
            self.channels.emit(ChatEvent::MessagesChanged { messages });
        }

        let loading = coordinator.is_loading();
        if self.published.loading != loading {
            self.published.loading = loading;
            self.channels.emit(ChatEvent::LoadingChanged { loading });
        }

        let error = coordinator.last_error().map(str::to_owned);
        if self.published.error != error {
            self.published.error.clone_from(&error);
            self.channels.emit(ChatEvent::ErrorChanged { error });
        }

        if let Some(millis) = coordinator.latency_ms()
            && self.published.latency != Some(millis)
        {
            self.published.latency = Some(millis);
            self.channels.emit(ChatEvent::Latency { millis });
        }

        for notice in coordinator.drain_notices() {
            self.channels.emit(ChatEvent::Notice(notice));
        }
    }
}

async fn next_inbound(
    rx: &mut Option<broadcast::Receiver<InboundEvent>>,
) -> Result<InboundEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn next_transition(
    rx: &mut Option<broadcast::Receiver<Transition>>,
) -> Result<Transition, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn next_outcome(pending: &mut Option<BoxFuture<'static, RestOutcome>>) -> RestOutcome {
    match pending.as_mut() {
        Some(send) => send.await,
        None => future::pending().await,
    }
}
