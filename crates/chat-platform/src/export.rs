//! Transcript rendering for locally backed-up sessions.

use chat_core::{ChatMessage, ExportFormat, ExportedTranscript, MessageRole};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Summary counters derived from a message list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub user_messages: usize,
    pub bot_messages: usize,
}

impl SessionMetadata {
    pub fn from_messages(session_id: &str, messages: &[ChatMessage]) -> Self {
        Self {
            session_id: session_id.to_owned(),
            message_count: messages.len(),
            last_activity: messages.last().map(|m| m.timestamp),
            created_at: messages.first().map(|m| m.timestamp),
            user_messages: count_role(messages, MessageRole::User),
            bot_messages: count_role(messages, MessageRole::Bot),
        }
    }
}

fn count_role(messages: &[ChatMessage], role: MessageRole) -> usize {
    messages.iter().filter(|m| m.role == role).count()
}

/// Render `messages` as a transcript. Only the JSON form can fail.
pub fn render_transcript(
    session_id: &str,
    messages: &[ChatMessage],
    format: ExportFormat,
    exported_at: DateTime<Utc>,
) -> Result<ExportedTranscript, serde_json::Error> {
    Ok(match format {
        ExportFormat::Json => {
            ExportedTranscript::Json(render_json(session_id, messages, exported_at)?)
        }
        ExportFormat::Csv => ExportedTranscript::Text(render_csv(messages)),
        ExportFormat::Txt => ExportedTranscript::Text(render_text(session_id, messages, exported_at)),
    })
}

fn render_json(
    session_id: &str,
    messages: &[ChatMessage],
    exported_at: DateTime<Utc>,
) -> Result<Value, serde_json::Error> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Document<'a> {
        #[serde(flatten)]
        metadata: SessionMetadata,
        exported_at: DateTime<Utc>,
        format: ExportFormat,
        messages: &'a [ChatMessage],
    }

    serde_json::to_value(Document {
        metadata: SessionMetadata::from_messages(session_id, messages),
        exported_at,
        format: ExportFormat::Json,
        messages,
    })
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Bot => "bot",
        MessageRole::System => "system",
        MessageRole::Error => "error",
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

fn render_csv(messages: &[ChatMessage]) -> String {
    let mut out = String::from("timestamp,type,content,sources\n");
    for message in messages {
        let sources = message
            .sources
            .iter()
            .map(|source| source.url.as_str())
            .filter(|url| !url.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let row = [
            csv_field(&message.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            csv_field(role_label(message.role)),
            csv_field(&message.content),
            csv_field(&sources),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn render_text(session_id: &str, messages: &[ChatMessage], exported_at: DateTime<Utc>) -> String {
    let mut out = format!(
        "Chat session {session_id}\nExported {}\n\n",
        exported_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    for message in messages {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            role_label(message.role).to_uppercase(),
            message.content
        ));
        for source in &message.sources {
            out.push_str(&format!(
                "    - {} ({}) {}\n",
                source.title, source.outlet, source.url
            ));
        }
    }
    out
}
