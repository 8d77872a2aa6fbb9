use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::Subscription,
    error::ChatError,
    state_machine::Transition,
    types::{ChatMessage, ChatReply, ConnectionState, InboundEvent, InboundEventKind, OutboundEvent},
};

/// Boxed inbound event handler accepted by [`RealtimeTransport::subscribe`].
pub type InboundHandler = Box<dyn Fn(&InboundEvent) + Send + Sync>;

/// Request/response operations the delivery coordinator depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Request a fresh backend session and return its id.
    async fn create_session(&self) -> Result<String, ChatError>;

    /// Send one message and wait for the answer.
    ///
    /// Resolves to a `Cancelled` error once `cancel` fires.
    async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ChatError>;

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError>;

    async fn clear_session(&self, session_id: &str) -> Result<(), ChatError>;
}

/// Persistent bidirectional channel with automatic reconnection.
pub trait RealtimeTransport: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Send an event when connected. Returns whether the send was attempted.
    ///
    /// Events are never queued while the channel is down.
    fn publish(&self, event: OutboundEvent) -> bool;

    /// Register a handler for one inbound event kind.
    fn subscribe(&self, kind: InboundEventKind, handler: InboundHandler) -> Subscription;

    /// Stream of every inbound event, for the runtime loop.
    fn events(&self) -> broadcast::Receiver<InboundEvent>;

    /// Current connection state, updated on every transition.
    ///
    /// Intermediate states may be skipped; use [`Self::transitions`] to see
    /// each one.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Every state change, in order.
    fn transitions(&self) -> broadcast::Receiver<Transition>;

    /// Start connecting. No-op while a connection task is alive.
    fn connect(&self);

    /// Stop the connection task, drop queued outbound frames and handlers.
    fn disconnect(&self);
}
