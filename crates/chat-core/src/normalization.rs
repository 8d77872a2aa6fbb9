use serde_json::{Map, Value};

use crate::{
    error::ChatError,
    types::{ChatMessage, ChatReply, MessageRole},
};

/// Answer shown when the backend replied without any answer text.
pub const FALLBACK_ANSWER: &str = "I received your message but could not generate a response.";

/// Convert a request/response reply into the finalized user + bot pair.
pub fn normalize_rest_reply(content: &str, reply: ChatReply) -> (ChatMessage, ChatMessage) {
    let user = ChatMessage::local(MessageRole::User, content.trim());
    let answer = reply
        .answer
        .filter(|answer| !answer.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_ANSWER.to_owned());
    let bot = ChatMessage::local(MessageRole::Bot, answer)
        .with_sources(reply.sources)
        .with_metadata(reply.metadata);
    (user, bot)
}

/// Convert a failed send into the `error`-role list entry.
pub fn normalize_send_failure(error: &ChatError) -> ChatMessage {
    let mut metadata = Map::new();
    metadata.insert("code".into(), Value::String(error.code.clone()));
    if let Ok(category) = serde_json::to_value(error.category) {
        metadata.insert("category".into(), category);
    }
    if let Some(status) = error.status {
        metadata.insert("status".into(), Value::from(status));
    }
    if let Some(retry_after_ms) = error.retry_after_ms {
        metadata.insert("retryAfterMs".into(), Value::from(retry_after_ms));
    }
    ChatMessage::local(MessageRole::Error, error.user_message()).with_metadata(Some(metadata))
}
