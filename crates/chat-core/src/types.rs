use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix carried by optimistic, not-yet-confirmed message ids.
pub const OPTIMISTIC_ID_PREFIX: &str = "temp-";
/// Prefix carried by ids the client finalized itself (REST replies, promoted echoes).
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Real-time channel state reported by the transport client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and no reconnection scheduled.
    #[default]
    Disconnected,
    /// First connection attempt is running.
    Connecting,
    /// Channel is open and accepts outbound events.
    Connected,
    /// Connection was lost and a retry is scheduled or running.
    Reconnecting,
    /// The transport failed; recovery is still possible.
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Error => "Connection Error",
        }
    }
}

/// Author role of a chat message. Serialized as the wire field `type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
    System,
    Error,
}

/// Cited news document attached to a bot answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub outlet: String,
    /// Retrieval relevance, always within `0.0..=1.0`.
    #[serde(default, deserialize_with = "deserialize_relevance")]
    pub relevance_score: f64,
    #[serde(default)]
    pub snippet: String,
}

impl Source {
    /// Relevance rendered as a whole percentage.
    pub fn relevance_percent(&self) -> u8 {
        (self.relevance_score * 100.0).round() as u8
    }
}

/// One entry of the session message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default = "fallback_message_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            sources: Vec::new(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Optimistic user message shown before any transport confirmed it.
    pub fn optimistic_user(content: impl Into<String>) -> Self {
        Self::new(optimistic_id(), MessageRole::User, content)
    }

    pub fn local(role: MessageRole, content: impl Into<String>) -> Self {
        Self::new(local_id(role), role, content)
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Map<String, Value>>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_optimistic(&self) -> bool {
        is_optimistic_id(&self.id)
    }

    pub fn is_client_generated(&self) -> bool {
        is_client_generated_id(&self.id)
    }
}

pub fn optimistic_id() -> String {
    format!("{OPTIMISTIC_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn local_id(role: MessageRole) -> String {
    let role = match role {
        MessageRole::User => "user",
        MessageRole::Bot => "bot",
        MessageRole::System => "system",
        MessageRole::Error => "error",
    };
    format!("{LOCAL_ID_PREFIX}{role}-{}", Uuid::new_v4().simple())
}

pub fn is_optimistic_id(id: &str) -> bool {
    id.starts_with(OPTIMISTIC_ID_PREFIX)
}

pub fn is_client_generated_id(id: &str) -> bool {
    is_optimistic_id(id) || id.starts_with(LOCAL_ID_PREFIX)
}

fn fallback_message_id() -> String {
    format!("srv-{}", Uuid::new_v4().simple())
}

fn deserialize_relevance<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    if raw.is_nan() {
        return Ok(0.0);
    }
    Ok(raw.clamp(0.0, 1.0))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    let millis = match Option::<RawTimestamp>::deserialize(deserializer)? {
        None => return Ok(Utc::now()),
        Some(RawTimestamp::Text(text)) => return Ok(parse_timestamp_text(&text)),
        Some(RawTimestamp::Millis(ms)) => ms,
        Some(RawTimestamp::Float(ms)) => ms as i64,
    };

    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp {millis} is out of range")))
}

/// Offset-less timestamps are read as UTC. Unparseable text becomes the
/// receive time so the message itself is kept.
fn parse_timestamp_text(text: &str) -> DateTime<Utc> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return parsed.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return naive.and_utc();
        }
    }
    tracing::warn!(timestamp = text, "unrecognized message timestamp; using receive time");
    Utc::now()
}

/// Body returned by `POST /api/chat/send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatReply {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Body returned by `GET /api/chat/history/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// Body returned by `POST /api/session/create`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// Body returned by `GET /api/session/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    #[serde(default, alias = "id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Free-form usage counters from `GET /api/session/{id}/stats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionStats {
    #[serde(flatten)]
    pub counters: BTreeMap<String, Value>,
}

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
}

/// Transcript export format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Txt,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Txt => "txt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "txt" | "text" => Ok(Self::Txt),
            other => Err(format!("unsupported export format '{other}'")),
        }
    }
}

/// Exported transcript, either structured JSON or a rendered text body.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportedTranscript {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub session_id: String,
    pub message: String,
}

/// Events the client publishes over the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinSession(String),
    SendMessage(SendMessagePayload),
    ClearSession(String),
    /// Client timestamp in epoch milliseconds.
    Ping(i64),
}

/// Events received from the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    SessionHistory(Vec<ChatMessage>),
    NewMessage(ChatMessage),
    BotTyping(bool),
    SessionCleared,
    Error(String),
    /// Echo of the ping timestamp in epoch milliseconds.
    Pong(i64),
}

/// Discriminant of [`InboundEvent`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundEventKind {
    SessionHistory,
    NewMessage,
    BotTyping,
    SessionCleared,
    Error,
    Pong,
}

impl InboundEvent {
    pub fn kind(&self) -> InboundEventKind {
        match self {
            Self::SessionHistory(_) => InboundEventKind::SessionHistory,
            Self::NewMessage(_) => InboundEventKind::NewMessage,
            Self::BotTyping(_) => InboundEventKind::BotTyping,
            Self::SessionCleared => InboundEventKind::SessionCleared,
            Self::Error(_) => InboundEventKind::Error,
            Self::Pong(_) => InboundEventKind::Pong,
        }
    }
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Submit a new user message.
    Send { content: String },
    /// Resubmit the most recent user-authored content.
    RetryLast,
    /// Abort the in-flight request/response send.
    Cancel,
    /// Clear the session on the server and locally.
    Clear,
    /// Reload the message list from the history endpoint.
    ReloadHistory,
    /// Measure real-time round-trip latency.
    Ping,
}

/// Severity of a transient notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Short-lived user-facing notification (the terminal prints it once).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

/// Event stream output emitted by the chat runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The runtime finished session setup and history load.
    SessionReady { session_id: String, fallback: bool },
    /// Real-time channel state changed.
    ConnectionChanged { state: ConnectionState },
    /// Full replacement of the canonical message list.
    MessagesChanged { messages: Vec<ChatMessage> },
    /// Loading indicator changed (send in flight or bot typing).
    LoadingChanged { loading: bool },
    /// Latest user-visible error, cleared with `None`.
    ErrorChanged { error: Option<String> },
    Notice(Notice),
    /// Ping round-trip time.
    Latency { millis: i64 },
}
