use chat_core::{ChatMessage, ExportFormat, ExportedTranscript, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    export::{SessionMetadata, render_transcript},
    store::{KeyValueStore, ScopedStore, StoreError},
};

/// Namespace shared by every client key.
pub const STORE_NAMESPACE: &str = "rag-chat";

const SESSION_ID_KEY: &str = "session-id";
const SESSION_HISTORY_KEY: &str = "session-history";
const PREFERENCES_KEY: &str = "preferences";
const LAST_ACTIVE_KEY: &str = "last-active";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub theme: Theme,
    pub enable_notifications: bool,
    pub enable_sounds: bool,
    pub auto_scroll: bool,
    pub compact_mode: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Theme::Auto,
            enable_notifications: true,
            enable_sounds: false,
            auto_scroll: true,
            compact_mode: false,
        }
    }
}

/// Partial preference update; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferencesPatch {
    pub theme: Option<Theme>,
    pub enable_notifications: Option<bool>,
    pub enable_sounds: Option<bool>,
    pub auto_scroll: Option<bool>,
    pub compact_mode: Option<bool>,
}

impl PreferencesPatch {
    /// Parse a `key=value` assignment such as `theme=dark` or `compact_mode=true`.
    pub fn parse_assignment(raw: &str) -> Result<Self, String> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
        let key = key.trim().to_ascii_lowercase().replace('-', "_");
        let value = value.trim();
        let flag = || match value.to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            other => Err(format!("expected a boolean for {key}, got '{other}'")),
        };

        let mut patch = Self::default();
        match key.as_str() {
            "theme" => {
                patch.theme = Some(match value.to_ascii_lowercase().as_str() {
                    "light" => Theme::Light,
                    "dark" => Theme::Dark,
                    "auto" => Theme::Auto,
                    other => return Err(format!("unknown theme '{other}'")),
                })
            }
            "enable_notifications" | "notifications" => patch.enable_notifications = Some(flag()?),
            "enable_sounds" | "sounds" => patch.enable_sounds = Some(flag()?),
            "auto_scroll" => patch.auto_scroll = Some(flag()?),
            "compact_mode" | "compact" => patch.compact_mode = Some(flag()?),
            other => return Err(format!("unknown preference '{other}'")),
        }
        Ok(patch)
    }

    fn apply_to(&self, preferences: &mut Preferences) {
        if let Some(theme) = self.theme {
            preferences.theme = theme;
        }
        if let Some(value) = self.enable_notifications {
            preferences.enable_notifications = value;
        }
        if let Some(value) = self.enable_sounds {
            preferences.enable_sounds = value;
        }
        if let Some(value) = self.auto_scroll {
            preferences.auto_scroll = value;
        }
        if let Some(value) = self.compact_mode {
            preferences.compact_mode = value;
        }
    }
}

/// Best-effort client persistence: session id, offline history, preferences.
///
/// Reads never fail; missing or corrupt values fall back to defaults.
#[derive(Debug, Clone)]
pub struct ClientStateStore<S: KeyValueStore> {
    store: ScopedStore<S>,
}

impl<S: KeyValueStore> ClientStateStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            store: ScopedStore::new(inner, STORE_NAMESPACE),
        }
    }

    /// Previously stored session id, if present and well formed.
    pub fn stored_session_id(&self) -> Option<SessionId> {
        let raw = self.read(SESSION_ID_KEY)?;
        match SessionId::parse(&raw) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("ignoring malformed stored session id");
                None
            }
        }
    }

    pub fn store_session_id(&self, id: &SessionId) -> Result<(), StoreError> {
        self.store.set(SESSION_ID_KEY, id.as_str())
    }

    pub fn clear_session_id(&self) -> Result<(), StoreError> {
        ignore_missing(self.store.delete(SESSION_ID_KEY))
    }

    /// Offline backup of a session's messages.
    pub fn session_history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.read_json(&history_key(session_id)).unwrap_or_default()
    }

    /// Store the backup. Optimistic entries are never persisted.
    pub fn store_session_history(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        let confirmed: Vec<&ChatMessage> = messages.iter().filter(|m| !m.is_optimistic()).collect();
        let encoded = serde_json::to_string(&confirmed)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.store.set(&history_key(session_id), &encoded)
    }

    pub fn clear_session_history(&self, session_id: &str) -> Result<(), StoreError> {
        ignore_missing(self.store.delete(&history_key(session_id)))
    }

    pub fn preferences(&self) -> Preferences {
        self.read_json(PREFERENCES_KEY).unwrap_or_default()
    }

    /// Merge `patch` into the stored preferences and return the result.
    pub fn update_preferences(&self, patch: &PreferencesPatch) -> Result<Preferences, StoreError> {
        let mut preferences = self.preferences();
        patch.apply_to(&mut preferences);
        let encoded = serde_json::to_string(&preferences)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.store.set(PREFERENCES_KEY, &encoded)?;
        Ok(preferences)
    }

    pub fn touch_last_active(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.set(LAST_ACTIVE_KEY, &at.to_rfc3339())
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        let raw = self.read(LAST_ACTIVE_KEY)?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()
    }

    /// Remove the stored session id and every history backup.
    ///
    /// Preferences are kept. Returns the number of keys removed.
    pub fn clear_all_session_data(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if key.starts_with(SESSION_ID_KEY) || key.starts_with(SESSION_HISTORY_KEY) {
                ignore_missing(self.store.delete(&key))?;
                removed += 1;
            }
        }
        debug!(removed, "cleared session data");
        Ok(removed)
    }

    pub fn session_metadata(&self, session_id: &str) -> SessionMetadata {
        SessionMetadata::from_messages(session_id, &self.session_history(session_id))
    }

    /// Render the offline backup in the requested format.
    pub fn export_local(
        &self,
        session_id: &str,
        format: ExportFormat,
    ) -> Result<ExportedTranscript, StoreError> {
        render_transcript(
            session_id,
            &self.session_history(session_id),
            format,
            Utc::now(),
        )
        .map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(raw) => Some(raw),
            Err(StoreError::NotFound) => None,
            Err(err) => {
                warn!(key, error = %err, "failed reading client state");
                None
            }
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding malformed client state");
                None
            }
        }
    }
}

fn history_key(session_id: &str) -> String {
    format!("{SESSION_HISTORY_KEY}-{session_id}")
}

fn ignore_missing(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(StoreError::NotFound) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use chat_core::MessageRole;

    use super::*;
    use crate::store::InMemoryStore;

    const SESSION: &str = "3f2b8c1e-9d4a-4b6f-8a2e-1c3d5e7f9a0b";

    fn state() -> (InMemoryStore, ClientStateStore<InMemoryStore>) {
        let base = InMemoryStore::default();
        (base.clone(), ClientStateStore::new(base))
    }

    #[test]
    fn stores_and_validates_session_id() {
        let (base, state) = state();
        assert_eq!(state.stored_session_id(), None);

        let id = SessionId::parse(SESSION).expect("valid id");
        state.store_session_id(&id).expect("store should work");
        assert_eq!(state.stored_session_id(), Some(id));
        assert_eq!(
            base.get_value("rag-chat-session-id").expect("raw key"),
            SESSION
        );

        base.set_value("rag-chat-session-id", "not-a-uuid")
            .expect("raw set");
        assert_eq!(state.stored_session_id(), None);

        state.clear_session_id().expect("clear should work");
        state.clear_session_id().expect("clearing twice is fine");
    }

    #[test]
    fn history_backup_skips_optimistic_entries() {
        let (_, state) = state();
        let messages = vec![
            ChatMessage::new("u1", MessageRole::User, "question"),
            ChatMessage::optimistic_user("pending"),
        ];
        state
            .store_session_history(SESSION, &messages)
            .expect("store should work");

        let restored = state.session_history(SESSION);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "u1");
        assert_eq!(state.session_metadata(SESSION).user_messages, 1);
    }

    #[test]
    fn corrupt_history_reads_as_empty() {
        let (base, state) = state();
        base.set_value(&format!("rag-chat-session-history-{SESSION}"), "{oops")
            .expect("raw set");
        assert!(state.session_history(SESSION).is_empty());
    }

    #[test]
    fn preferences_default_and_merge() {
        let (_, state) = state();
        assert_eq!(state.preferences(), Preferences::default());

        let patch = PreferencesPatch::parse_assignment("theme=dark").expect("valid patch");
        state.update_preferences(&patch).expect("update should work");
        let patch = PreferencesPatch::parse_assignment("compact=on").expect("valid patch");
        let updated = state.update_preferences(&patch).expect("update should work");

        assert_eq!(updated.theme, Theme::Dark);
        assert!(updated.compact_mode);
        assert!(updated.enable_notifications);
        assert_eq!(state.preferences(), updated);
    }

    #[test]
    fn rejects_unknown_preference_assignments() {
        assert!(PreferencesPatch::parse_assignment("theme=neon").is_err());
        assert!(PreferencesPatch::parse_assignment("volume=3").is_err());
        assert!(PreferencesPatch::parse_assignment("sounds=maybe").is_err());
        assert!(PreferencesPatch::parse_assignment("theme").is_err());
    }

    #[test]
    fn clear_all_keeps_preferences() {
        let (base, state) = state();
        let id = SessionId::parse(SESSION).expect("valid id");
        state.store_session_id(&id).expect("store id");
        state
            .store_session_history(SESSION, &[ChatMessage::new("u1", MessageRole::User, "q")])
            .expect("store history");
        state
            .update_preferences(&PreferencesPatch::default())
            .expect("store preferences");

        assert_eq!(state.clear_all_session_data().expect("clear all"), 2);
        assert_eq!(
            base.keys().expect("keys"),
            vec!["rag-chat-preferences".to_owned()]
        );
    }

    #[test]
    fn records_last_active_timestamp() {
        let (_, state) = state();
        assert_eq!(state.last_active(), None);
        let now = Utc::now();
        state.touch_last_active(now).expect("touch should work");
        let stored = state.last_active().expect("timestamp should be stored");
        assert_eq!(stored.timestamp(), now.timestamp());
    }

    #[test]
    fn exports_local_backup() {
        let (_, state) = state();
        state
            .store_session_history(SESSION, &[ChatMessage::new("u1", MessageRole::User, "q")])
            .expect("store history");
        match state.export_local(SESSION, ExportFormat::Txt) {
            Ok(ExportedTranscript::Text(text)) => assert!(text.contains("USER: q")),
            other => panic!("unexpected export: {other:?}"),
        }
    }

    #[test]
    fn json_backup_export_is_a_document_not_null() {
        let (_, state) = state();
        state
            .store_session_history(SESSION, &[ChatMessage::new("b1", MessageRole::Bot, "a")])
            .expect("store history");
        let ExportedTranscript::Json(doc) = state
            .export_local(SESSION, ExportFormat::Json)
            .expect("json backup export renders")
        else {
            panic!("json export should be structured");
        };
        assert!(doc.is_object());
        assert_eq!(doc["sessionId"], SESSION);
        assert_eq!(doc["botMessages"], 1);
        assert_eq!(doc["messages"][0]["content"], "a");
    }
}
