use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{ChatMessage, MessageRole};

/// Errors that can occur while applying message list operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageLogError {
    /// An operation referenced a message id that is not present.
    #[error("message with id '{0}' was not found")]
    MissingMessage(String),
    /// An operation would introduce a second entry with the same id.
    #[error("message with id '{0}' is already present")]
    DuplicateId(String),
}

/// One mutation of the canonical message list.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOp {
    Append(ChatMessage),
    Replace { id: String, message: ChatMessage },
    Remove { id: String },
    Reset(Vec<ChatMessage>),
    Clear,
}

/// Ordered message list with unique ids and bounded retention.
#[derive(Debug, Clone)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
    max_messages: usize,
}

impl MessageLog {
    /// Create a log with a message cap (`max_messages >= 1`).
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Current messages in display order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a message with `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Message with `id`, if present.
    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Apply operations as one atomic update.
    ///
    /// Either every operation applies or the log is left untouched.
    pub fn apply_ops(&mut self, ops: &[MessageOp]) -> Result<(), MessageLogError> {
        let mut staged = self.messages.clone();
        for op in ops {
            match op {
                MessageOp::Append(message) => {
                    if staged.iter().any(|m| m.id == message.id) {
                        return Err(MessageLogError::DuplicateId(message.id.clone()));
                    }
                    staged.push(message.clone());
                }
                MessageOp::Replace { id, message } => {
                    if message.id != *id && staged.iter().any(|m| m.id == message.id) {
                        return Err(MessageLogError::DuplicateId(message.id.clone()));
                    }
                    let existing = staged
                        .iter_mut()
                        .find(|m| m.id == *id)
                        .ok_or_else(|| MessageLogError::MissingMessage(id.clone()))?;
                    *existing = message.clone();
                }
                MessageOp::Remove { id } => {
                    let idx = staged
                        .iter()
                        .position(|m| m.id == *id)
                        .ok_or_else(|| MessageLogError::MissingMessage(id.clone()))?;
                    staged.remove(idx);
                }
                MessageOp::Reset(messages) => {
                    staged.clear();
                    for message in messages {
                        // histories occasionally repeat ids; first occurrence wins
                        if !staged.iter().any(|m| m.id == message.id) {
                            staged.push(message.clone());
                        }
                    }
                }
                MessageOp::Clear => staged.clear(),
            }
        }

        self.messages = staged;
        self.trim_to_max();
        Ok(())
    }

    /// Find a client-generated entry that corresponds to a confirmed message.
    ///
    /// Optimistic (`temp-`) entries are preferred over finalized `local-` ones.
    pub fn find_correlated(
        &self,
        role: MessageRole,
        content: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Option<&ChatMessage> {
        let content = content.trim();
        let candidates = || {
            self.messages.iter().filter(move |m| {
                m.is_client_generated()
                    && m.role == role
                    && m.content.trim() == content
                    && (m.timestamp - at).abs() <= window
            })
        };
        candidates()
            .find(|m| m.is_optimistic())
            .or_else(|| candidates().next())
    }

    /// Content of the newest user message, used by retry.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    fn trim_to_max(&mut self) {
        if self.messages.len() <= self.max_messages {
            return;
        }

        let excess = self.messages.len() - self.max_messages;
        self.messages.drain(0..excess);
    }
}
