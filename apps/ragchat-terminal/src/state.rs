//! Presentation state reducer for `ragchat-terminal`.

use std::collections::HashSet;

use chat_core::{ChatEvent, ChatMessage, ConnectionState, MessageRole, NoticeLevel, Source};
use tracing::{debug, trace};

const DEFAULT_STATUS: &str = "Starting";
const REST_ONLY_STATUS: &str = "REST only";

/// Cited source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceView {
    pub title: String,
    pub outlet: String,
    pub url: String,
    pub relevance_percent: u8,
}

/// Message row as presented to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<SourceView>,
}

/// Full snapshot after state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub session_id: Option<String>,
    pub fallback_session: bool,
    pub messages: Vec<MessageView>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub loading: bool,
    pub latency_ms: Option<i64>,
}

/// Folds runtime events into a snapshot and the lines to print.
#[derive(Debug, Clone)]
pub struct TerminalState {
    realtime_enabled: bool,
    compact_mode: bool,
    session_id: Option<String>,
    fallback_session: bool,
    messages: Vec<ChatMessage>,
    printed: HashSet<String>,
    status_text: String,
    error_text: Option<String>,
    loading: bool,
    latency_ms: Option<i64>,
}

impl TerminalState {
    pub fn new(realtime_enabled: bool) -> Self {
        Self {
            realtime_enabled,
            compact_mode: false,
            session_id: None,
            fallback_session: false,
            messages: Vec::new(),
            printed: HashSet::new(),
            status_text: if realtime_enabled {
                DEFAULT_STATUS.to_owned()
            } else {
                REST_ONLY_STATUS.to_owned()
            },
            error_text: None,
            loading: false,
            latency_ms: None,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            session_id: self.session_id.clone(),
            fallback_session: self.fallback_session,
            messages: self
                .messages
                .iter()
                .filter(|message| !message.is_optimistic())
                .map(message_view)
                .collect(),
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            loading: self.loading,
            latency_ms: self.latency_ms,
        }
    }

    /// Compact mode prints messages without their source lists.
    pub fn set_compact_mode(&mut self, compact_mode: bool) {
        self.compact_mode = compact_mode;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Feed one runtime event and return the lines to print.
    pub fn handle_event(&mut self, event: ChatEvent) -> Vec<String> {
        match event {
            ChatEvent::SessionReady {
                session_id,
                fallback,
            } => {
                self.fallback_session = fallback;
                let line = if fallback {
                    format!("* Offline session {session_id} (server unavailable)")
                } else {
                    format!("* Session {session_id}")
                };
                self.session_id = Some(session_id);
                vec![line]
            }
            ChatEvent::ConnectionChanged { state } => {
                let status = self.status_label(state);
                if status == self.status_text {
                    return Vec::new();
                }
                self.status_text = status.to_owned();
                vec![format!("* {status}")]
            }
            ChatEvent::MessagesChanged { messages } => self.replace_messages(messages),
            ChatEvent::LoadingChanged { loading } => {
                self.loading = loading;
                if loading {
                    vec!["* Thinking...".to_owned()]
                } else {
                    Vec::new()
                }
            }
            ChatEvent::ErrorChanged { error } => {
                self.error_text = error;
                Vec::new()
            }
            ChatEvent::Notice(notice) => {
                let marker = match notice.level {
                    NoticeLevel::Info => "*",
                    NoticeLevel::Success => "+",
                    NoticeLevel::Error => "!",
                };
                vec![format!("{marker} {}", notice.text)]
            }
            ChatEvent::Latency { millis } => {
                self.latency_ms = Some(millis);
                vec![format!("* Latency {millis} ms")]
            }
        }
    }

    fn status_label(&self, state: ConnectionState) -> &'static str {
        if !self.realtime_enabled && state == ConnectionState::Disconnected {
            return REST_ONLY_STATUS;
        }
        state.label()
    }

    fn replace_messages(&mut self, messages: Vec<ChatMessage>) -> Vec<String> {
        trace!(count = messages.len(), "message list replaced");
        if messages.is_empty() {
            self.printed.clear();
        }

        let mut lines = Vec::new();
        for (index, message) in messages.iter().enumerate() {
            if message.is_optimistic() || self.printed.contains(&message.id) {
                continue;
            }
            // a printed entry swapped for its confirmed copy keeps its slot
            let already_shown = self.messages.get(index).is_some_and(|previous| {
                self.printed.contains(&previous.id)
                    && previous.role == message.role
                    && previous.content == message.content
            });
            self.printed.insert(message.id.clone());
            if already_shown {
                debug!(message_id = %message.id, "confirmed copy of printed message");
                continue;
            }
            lines.extend(render_message(message, self.compact_mode));
        }

        self.messages = messages;
        lines
    }
}

fn message_view(message: &ChatMessage) -> MessageView {
    MessageView {
        id: message.id.clone(),
        role: message.role,
        content: message.content.clone(),
        sources: message.sources.iter().map(source_view).collect(),
    }
}

fn source_view(source: &Source) -> SourceView {
    SourceView {
        title: source.title.clone(),
        outlet: source.outlet.clone(),
        url: source.url.clone(),
        relevance_percent: source.relevance_percent(),
    }
}

fn role_prefix(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Bot => "bot",
        MessageRole::System => "system",
        MessageRole::Error => "error",
    }
}

/// Render one message, followed by its sources unless `compact`.
pub fn render_message(message: &ChatMessage, compact: bool) -> Vec<String> {
    let mut lines = vec![format!(
        "[{}] {}> {}",
        message.timestamp.format("%H:%M"),
        role_prefix(message.role),
        message.content
    )];
    if compact {
        return lines;
    }
    for (index, source) in message.sources.iter().enumerate() {
        let outlet = if source.outlet.is_empty() {
            String::new()
        } else {
            format!(" ({})", source.outlet)
        };
        lines.push(format!(
            "    [{}] {}{outlet} {}% {}",
            index + 1,
            source.title,
            source.relevance_percent(),
            source.url
        ));
    }
    lines
}
