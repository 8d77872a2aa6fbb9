//! Core chat contract shared between the runtime and presentation consumers.
//!
//! This crate defines the message model and real-time event protocol, the
//! connection state machine, the message log, session identity, and the
//! delivery coordinator that routes each send over the real-time channel or
//! the request/response API.

/// Async command/event channel primitives.
pub mod channel;
/// Optimistic send, fallback and reconciliation logic.
pub mod coordinator;
/// Inbound event handler registry.
pub mod dispatch;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Reply and failure normalization into list entries.
pub mod normalization;
/// Backoff policy used by reconnection loops.
pub mod retry;
/// Session identifier validation and startup acquisition.
pub mod session;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Canonical message list utilities.
pub mod timeline;
/// Seams between the coordinator and concrete clients.
pub mod transport;
/// Protocol types (messages, events, commands, payloads).
pub mod types;
/// Input length limits.
pub mod validation;

pub use channel::{
    ChatChannelError, ChatChannels, DEFAULT_COMMAND_BUFFER, DEFAULT_EVENT_BUFFER, EventEmitter,
    EventStream,
};
pub use coordinator::{
    ClearRoute, DeliveryConfig, DeliveryCoordinator, Dispatch, RestOutcome, RestSend,
};
pub use dispatch::{EventHandlers, Subscription};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{FALLBACK_ANSWER, normalize_rest_reply, normalize_send_failure};
pub use retry::RetryPolicy;
pub use session::{SessionId, SessionIdentity, SessionOrigin, create_or_restore};
pub use state_machine::{ConnectionStateMachine, StateObservers, Transition, TransportSignal};
pub use timeline::{MessageLog, MessageLogError, MessageOp};
pub use transport::{ChatApi, InboundHandler, RealtimeTransport};
pub use types::{
    ChatCommand, ChatEvent, ChatMessage, ChatReply, ConnectionState, CreateSessionResponse,
    ExportFormat, ExportedTranscript, HealthStatus, HistoryResponse, InboundEvent,
    InboundEventKind, MessageRole, Notice, NoticeLevel, OutboundEvent, SendMessagePayload,
    SessionDescriptor, SessionStats, Source,
};
pub use validation::MessageLimits;
