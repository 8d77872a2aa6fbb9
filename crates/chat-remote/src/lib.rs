//! Network clients and the runtime task for the RAG news chat client.
//!
//! [`RestClient`] speaks the HTTP API, [`RealtimeClient`] maintains the
//! WebSocket channel, and [`spawn_runtime`] wires both into a
//! [`chat_core::DeliveryCoordinator`] behind a command/event channel pair.

/// WebSocket transport with reconnection.
pub mod realtime;
/// HTTP API client.
pub mod rest;
/// Coordinator-owning runtime task.
pub mod runtime;

pub use realtime::{DEFAULT_CONNECT_TIMEOUT, RealtimeClient, RealtimeConfig, realtime_endpoint};
pub use rest::{
    ConnectivityReport, DEFAULT_REQUEST_TIMEOUT, RestClient, RestClientConfig, SessionValidation,
};
pub use runtime::{ChatRuntimeHandle, RuntimeParts, SharedClientState, spawn_runtime};
