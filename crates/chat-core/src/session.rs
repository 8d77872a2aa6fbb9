use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::{Uuid, Variant};

use crate::{
    error::{ChatError, ChatErrorCategory},
    transport::ChatApi,
};

/// Well-formed session identifier: a hyphenated UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse a candidate id; anything that is not a hyphenated v4 UUID with the
    /// RFC 4122 variant is rejected.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let raw = raw.trim();
        let malformed = || {
            ChatError::new(
                ChatErrorCategory::Validation,
                "malformed_session_id",
                format!("'{raw}' is not a valid session id"),
            )
        };
        // Uuid::parse_str also accepts simple, braced and urn forms
        if raw.len() != 36 {
            return Err(malformed());
        }
        let uuid = Uuid::parse_str(raw).map_err(|_| malformed())?;
        if uuid.get_version_num() != 4 || uuid.get_variant() != Variant::RFC4122 {
            return Err(malformed());
        }
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ChatError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ChatError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Where the active session id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOrigin {
    /// Issued by the backend; history and server clear are available.
    Server,
    /// Synthesized after the backend was unreachable or answered garbage.
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub id: SessionId,
    pub origin: SessionOrigin,
}

impl SessionIdentity {
    pub fn is_fallback(&self) -> bool {
        self.origin == SessionOrigin::LocalFallback
    }
}

/// Establish the session for this run.
///
/// A fresh backend session is always requested; when that fails the client
/// keeps working on a locally generated id.
pub async fn create_or_restore(api: &dyn ChatApi) -> SessionIdentity {
    match api.create_session().await {
        Ok(raw) => match SessionId::parse(&raw) {
            Ok(id) => {
                info!(session_id = %id, "created backend session");
                SessionIdentity {
                    id,
                    origin: SessionOrigin::Server,
                }
            }
            Err(err) => {
                warn!(error = %err, "backend returned malformed session id; using local fallback");
                local_fallback()
            }
        },
        Err(err) => {
            warn!(error = %err, "session create failed; using local fallback");
            local_fallback()
        }
    }
}

fn local_fallback() -> SessionIdentity {
    SessionIdentity {
        id: SessionId::generate(),
        origin: SessionOrigin::LocalFallback,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::types::{ChatMessage, ChatReply};

    struct CreateOnly(Result<String, ChatError>);

    #[async_trait]
    impl ChatApi for CreateOnly {
        async fn create_session(&self) -> Result<String, ChatError> {
            self.0.clone()
        }

        async fn send_message(
            &self,
            _session_id: &str,
            _content: &str,
            _cancel: CancellationToken,
        ) -> Result<ChatReply, ChatError> {
            Err(ChatError::cancelled())
        }

        async fn fetch_history(&self, _session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
            Ok(Vec::new())
        }

        async fn clear_session(&self, _session_id: &str) -> Result<(), ChatError> {
            Ok(())
        }
    }

    #[test]
    fn accepts_only_hyphenated_v4_ids() {
        assert!(SessionId::is_valid("3f2b8c1e-9d4a-4b6f-8a2e-1c3d5e7f9a0b"));
        assert!(SessionId::is_valid("3F2B8C1E-9D4A-4B6F-8A2E-1C3D5E7F9A0B"));
        // version 1
        assert!(!SessionId::is_valid("3f2b8c1e-9d4a-1b6f-8a2e-1c3d5e7f9a0b"));
        // non-RFC variant
        assert!(!SessionId::is_valid("3f2b8c1e-9d4a-4b6f-ca2e-1c3d5e7f9a0b"));
        assert!(!SessionId::is_valid("3f2b8c1e9d4a4b6f8a2e1c3d5e7f9a0b"));
        assert!(!SessionId::is_valid("not-a-session"));
        assert!(!SessionId::is_valid(""));
    }

    #[test]
    fn normalizes_parsed_ids_to_lowercase() {
        let id = SessionId::parse("3F2B8C1E-9D4A-4B6F-8A2E-1C3D5E7F9A0B").expect("valid id");
        assert_eq!(id.as_str(), "3f2b8c1e-9d4a-4b6f-8a2e-1c3d5e7f9a0b");
    }

    #[test]
    fn generated_ids_are_valid() {
        let id = SessionId::generate();
        assert!(SessionId::is_valid(id.as_str()));
    }

    #[tokio::test]
    async fn uses_backend_session_when_available() {
        let api = CreateOnly(Ok("3f2b8c1e-9d4a-4b6f-8a2e-1c3d5e7f9a0b".into()));
        let identity = create_or_restore(&api).await;
        assert_eq!(identity.origin, SessionOrigin::Server);
        assert_eq!(identity.id.as_str(), "3f2b8c1e-9d4a-4b6f-8a2e-1c3d5e7f9a0b");
    }

    #[tokio::test]
    async fn falls_back_to_local_id_on_failure_or_malformed_id() {
        let failing = CreateOnly(Err(ChatError::new(
            ChatErrorCategory::Network,
            "network_unreachable",
            "connection refused",
        )));
        let identity = create_or_restore(&failing).await;
        assert!(identity.is_fallback());
        assert!(SessionId::is_valid(identity.id.as_str()));

        let garbage = CreateOnly(Ok("session-1".into()));
        assert!(create_or_restore(&garbage).await.is_fallback());
    }
}
