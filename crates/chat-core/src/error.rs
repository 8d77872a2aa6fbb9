use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// No response from the backend (unreachable, reset, timed out).
    Network,
    /// Backend answered with a 5xx status.
    Server,
    /// Backend rejected the request with a 4xx status.
    Client,
    /// Backend answered 429; a client error subtype carrying a retry hint.
    RateLimited,
    /// Real-time channel failure. Absorbed by reconnection.
    Transport,
    /// The request was aborted by the user or superseded.
    Cancelled,
    /// Local input validation failure.
    Validation,
    /// A send is already in flight.
    Busy,
    /// Serialization/deserialization failure.
    Serialization,
    /// Local persistence failure.
    Storage,
    /// Invalid configuration value.
    Config,
    /// Invariant break inside the client.
    Internal,
}

/// Stable error payload shared by the coordinator, clients and runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the error came from a response.
    pub status: Option<u16>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn cancelled() -> Self {
        Self::new(
            ChatErrorCategory::Cancelled,
            "request_cancelled",
            "request was cancelled",
        )
    }

    pub fn busy() -> Self {
        Self::new(
            ChatErrorCategory::Busy,
            "send_in_flight",
            "Please wait for the current message to complete",
        )
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Validation, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot apply '{action}' while connection is in state {current:?}"),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ChatErrorCategory::Cancelled
    }

    /// Text shown to the user for this error.
    ///
    /// Backend-provided messages win for client errors; transport and server
    /// failures use fixed wording.
    pub fn user_message(&self) -> String {
        match self.category {
            ChatErrorCategory::Network => "Network error. Please check your connection.".into(),
            ChatErrorCategory::Server => "Server error. Please try again later.".into(),
            ChatErrorCategory::RateLimited => "Too many requests. Please slow down.".into(),
            ChatErrorCategory::Transport => "Failed to connect to chat server.".into(),
            ChatErrorCategory::Cancelled => "Message cancelled".into(),
            ChatErrorCategory::Client
            | ChatErrorCategory::Validation
            | ChatErrorCategory::Busy
                if !self.message.is_empty() =>
            {
                self.message.clone()
            }
            _ => "Failed to send message. Please try again.".into(),
        }
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Client,
        500..=599 => ChatErrorCategory::Server,
        _ => ChatErrorCategory::Internal,
    }
}
