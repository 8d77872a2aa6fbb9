use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{
    ChatApi, ChatError, ChatErrorCategory, ChatMessage, ChatReply, CreateSessionResponse,
    ExportFormat, ExportedTranscript, HealthStatus, HistoryResponse, SendMessagePayload,
    SessionDescriptor, SessionStats, classify_http_status,
};
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response, header::RETRY_AFTER};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Log every request and response body at `debug`.
    pub debug_logs: bool,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            debug_logs: false,
        }
    }
}

/// Outcome of [`RestClient::test_connection`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityReport {
    pub success: bool,
    pub status: Option<String>,
    pub services: Option<Value>,
    pub error: Option<String>,
}

/// Outcome of [`RestClient::validate_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionValidation {
    pub valid: bool,
    pub session: Option<SessionDescriptor>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct PendingSend {
    generation: u64,
    token: Option<CancellationToken>,
}

/// HTTP client for the chat backend.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    debug_logs: bool,
    pending_send: Arc<Mutex<PendingSend>>,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self, ChatError> {
        let base_url = Url::parse(config.base_url.trim()).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_base_url",
                format!("invalid API base URL '{}': {err}", config.base_url),
            )
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_base_url",
                format!("API base URL must be http(s), got '{}'", base_url.scheme()),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http,
            base_url,
            debug_logs: config.debug_logs,
            pending_send: Arc::new(Mutex::new(PendingSend::default())),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus, ChatError> {
        self.execute_json(Method::GET, &["health"], &[], None::<&()>)
            .await
    }

    pub async fn create_session(&self) -> Result<String, ChatError> {
        let created: CreateSessionResponse = self
            .execute_json(Method::POST, &["api", "session", "create"], &[], None::<&()>)
            .await?;
        Ok(created.session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionDescriptor, ChatError> {
        self.execute_json(Method::GET, &["api", "session", session_id], &[], None::<&()>)
            .await
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<(), ChatError> {
        self.execute(Method::DELETE, &["api", "session", session_id], &[], None::<&()>)
            .await
            .map(|_| ())
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, ChatError> {
        self.execute_json(
            Method::GET,
            &["api", "session", session_id, "stats"],
            &[],
            None::<&()>,
        )
        .await
    }

    pub async fn export_session(
        &self,
        session_id: &str,
        format: ExportFormat,
    ) -> Result<ExportedTranscript, ChatError> {
        let response = self
            .execute(
                Method::GET,
                &["api", "session", session_id, "export"],
                &[("format", format.as_str())],
                None::<&()>,
            )
            .await?;
        match format {
            ExportFormat::Json => Ok(ExportedTranscript::Json(decode_json(response).await?)),
            ExportFormat::Csv | ExportFormat::Txt => {
                let body = response.text().await.map_err(map_reqwest_error)?;
                Ok(ExportedTranscript::Text(body))
            }
        }
    }

    /// Send one message and wait for the answer.
    ///
    /// Starting a send cancels the previous pending one. Cancelling `cancel`
    /// drops the request and resolves to a `Cancelled` error.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ChatError> {
        let generation = self.begin_send(&cancel);
        let payload = SendMessagePayload {
            session_id: session_id.to_owned(),
            message: content.to_owned(),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::cancelled()),
            result = self.execute_json(Method::POST, &["api", "chat", "send"], &[], Some(&payload)) => result,
        };
        self.end_send(generation);
        result
    }

    pub async fn fetch_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let history: HistoryResponse = self
            .execute_json(
                Method::GET,
                &["api", "chat", "history", session_id],
                &[],
                None::<&()>,
            )
            .await?;
        Ok(history.messages)
    }

    /// Probe `/health` without failing.
    pub async fn test_connection(&self) -> ConnectivityReport {
        match self.health().await {
            Ok(health) => ConnectivityReport {
                success: true,
                status: Some(health.status),
                services: serde_json::to_value(health.services).ok(),
                error: None,
            },
            Err(err) => ConnectivityReport {
                success: false,
                status: None,
                services: None,
                error: Some(err.message),
            },
        }
    }

    /// Check whether the backend still knows `session_id`.
    pub async fn validate_session(&self, session_id: &str) -> SessionValidation {
        match self.get_session(session_id).await {
            Ok(session) => SessionValidation {
                valid: true,
                session: Some(session),
                error: None,
            },
            Err(err) => SessionValidation {
                valid: false,
                session: None,
                error: Some(err.message),
            },
        }
    }

    fn begin_send(&self, cancel: &CancellationToken) -> u64 {
        let mut pending = self.pending_send.lock().expect("pending send lock poisoned");
        if let Some(previous) = pending.token.replace(cancel.clone()) {
            debug!("cancelling superseded send");
            previous.cancel();
        }
        pending.generation += 1;
        pending.generation
    }

    fn end_send(&self, generation: u64) {
        let mut pending = self.pending_send.lock().expect("pending send lock poisoned");
        if pending.generation == generation {
            pending.token = None;
        }
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_base_url",
                    "API base URL cannot carry a path",
                )
            })?;
            path.pop_if_empty().extend(segments);
        }
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("_t", &Utc::now().timestamp_millis().to_string());
        }
        Ok(url)
    }

    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<Response, ChatError> {
        let url = self.endpoint(segments, query)?;
        if self.debug_logs {
            let body = body.and_then(|body| serde_json::to_string(body).ok());
            debug!(method = %method, url = %url, body = ?body, "api request");
        }

        let mut request: RequestBuilder = self.http.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if self.debug_logs {
            debug!(method = %method, url = %url, status = status.as_u16(), "api response");
        }

        if status.is_success() {
            return Ok(response);
        }

        let error = error_from_response(response).await;
        warn!(
            method = %method,
            path = url.path(),
            status = status.as_u16(),
            error = %error,
            "api request failed"
        );
        Err(error)
    }

    async fn execute_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, ChatError> {
        let response = self.execute(method, segments, query, body).await?;
        decode_json(response).await
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ChatError> {
    let bytes = response.bytes().await.map_err(map_reqwest_error)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "invalid_response_body",
            err.to_string(),
        )
    })
}

async fn error_from_response(response: Response) -> ChatError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| format!("request failed with status {status}"));

    let mut error =
        ChatError::new(classify_http_status(status), format!("http_{status}"), message)
            .with_status(status);
    if let Some(retry_after) = retry_after {
        error = error.with_retry_after(retry_after);
    }
    error
}

fn map_reqwest_error(err: reqwest::Error) -> ChatError {
    if let Some(status) = err.status() {
        return ChatError::new(
            classify_http_status(status.as_u16()),
            format!("http_{}", status.as_u16()),
            err.to_string(),
        )
        .with_status(status.as_u16());
    }

    let (category, code) = if err.is_timeout() {
        (ChatErrorCategory::Network, "request_timeout")
    } else if err.is_connect() {
        (ChatErrorCategory::Network, "network_unreachable")
    } else if err.is_decode() {
        (ChatErrorCategory::Serialization, "invalid_response_body")
    } else if err.is_builder() {
        (ChatErrorCategory::Config, "invalid_request")
    } else {
        (ChatErrorCategory::Network, "network_error")
    };
    ChatError::new(category, code, err.to_string())
}

#[async_trait]
impl ChatApi for RestClient {
    async fn create_session(&self) -> Result<String, ChatError> {
        RestClient::create_session(self).await
    }

    async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ChatError> {
        RestClient::send_message(self, session_id, content, cancel).await
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        RestClient::fetch_history(self, session_id).await
    }

    async fn clear_session(&self, session_id: &str) -> Result<(), ChatError> {
        RestClient::clear_session(self, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RestClient {
        RestClient::new(RestClientConfig::new(base)).expect("client should build")
    }

    #[test]
    fn rejects_non_http_base_urls() {
        let err = RestClient::new(RestClientConfig::new("ftp://example.com"))
            .expect_err("ftp should be rejected");
        assert_eq!(err.code, "invalid_base_url");
        assert!(RestClient::new(RestClientConfig::new("not a url")).is_err());
    }

    #[test]
    fn builds_endpoints_with_cache_buster() {
        let client = client("http://localhost:5000/");
        let url = client
            .endpoint(&["api", "session", "abc", "export"], &[("format", "csv")])
            .expect("endpoint should build");

        assert_eq!(url.path(), "/api/session/abc/export");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("format".to_owned(), "csv".to_owned()));
        assert_eq!(pairs[1].0, "_t");
        assert!(pairs[1].1.parse::<i64>().is_ok());
    }

    #[test]
    fn keeps_base_path_prefix_and_escapes_segments() {
        let client = client("https://chat.example.com/backend");
        let url = client
            .endpoint(&["api", "chat", "history", "a/b"], &[])
            .expect("endpoint should build");
        assert_eq!(url.path(), "/backend/api/chat/history/a%2Fb");
    }

    #[test]
    fn superseding_send_cancels_previous_token() {
        let client = client("http://localhost:5000");
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let first_generation = client.begin_send(&first);
        let second_generation = client.begin_send(&second);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        client.end_send(first_generation);
        assert!(
            client
                .pending_send
                .lock()
                .expect("lock")
                .token
                .is_some()
        );
        client.end_send(second_generation);
        assert!(
            client
                .pending_send
                .lock()
                .expect("lock")
                .token
                .is_none()
        );
    }
}
