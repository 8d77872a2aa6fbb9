//! Environment-backed runtime configuration for `ragchat-terminal`.

use std::{env, path::PathBuf, time::Duration};

use chat_core::{DeliveryConfig, MessageLimits, RetryPolicy};
use chat_remote::{RealtimeConfig, RestClientConfig};
use thiserror::Error;
use url::Url;

const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";
const DEFAULT_DATA_DIR: &str = "./.ragchat-store";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;
const DEFAULT_MIN_MESSAGE_LENGTH: usize = 3;
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1_000;
const DEFAULT_ECHO_WINDOW_MS: u64 = 60_000;
const DEFAULT_MAX_MESSAGES: usize = 1_000;

/// Runtime configuration used by the terminal client.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalConfig {
    pub api_base_url: String,
    /// Real-time server URL. Defaults to the API base URL.
    pub socket_url: String,
    pub enable_socket: bool,
    /// Gates the `/export` command.
    pub enable_export: bool,
    /// Log requests, responses and raise the default log level.
    pub debug_logs: bool,
    /// Directory backing the local key/value store.
    pub data_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub min_message_length: usize,
    pub max_message_length: usize,
    pub echo_window_ms: u64,
    pub max_messages: usize,
}

impl TerminalConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base_url = optional_trimmed_env("RAGCHAT_API_BASE_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        validate_url("RAGCHAT_API_BASE_URL", &api_base_url, &["http", "https"])?;

        let socket_url = optional_trimmed_env("RAGCHAT_SOCKET_URL", &mut lookup)
            .unwrap_or_else(|| api_base_url.clone());
        validate_url(
            "RAGCHAT_SOCKET_URL",
            &socket_url,
            &["http", "https", "ws", "wss"],
        )?;

        let enable_socket = flag_unless_false("RAGCHAT_ENABLE_SOCKET", &mut lookup);
        let enable_export = flag_unless_false("RAGCHAT_ENABLE_EXPORT", &mut lookup);
        let debug_logs = flag_if_true("RAGCHAT_DEBUG_LOGS", &mut lookup);
        let data_dir = optional_trimmed_env("RAGCHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let request_timeout_ms = parse_with_default(
            "RAGCHAT_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        let connect_timeout_ms = parse_with_default(
            "RAGCHAT_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
            &mut lookup,
        )?;
        let reconnect_attempts = parse_with_default(
            "RAGCHAT_RECONNECT_ATTEMPTS",
            DEFAULT_RECONNECT_ATTEMPTS,
            &mut lookup,
        )?;
        let reconnect_delay_ms = parse_with_default(
            "RAGCHAT_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_delay_max_ms = parse_with_default(
            "RAGCHAT_RECONNECT_DELAY_MAX_MS",
            DEFAULT_RECONNECT_DELAY_MAX_MS,
            &mut lookup,
        )?;
        let min_message_length = parse_with_default(
            "RAGCHAT_MIN_MESSAGE_LENGTH",
            DEFAULT_MIN_MESSAGE_LENGTH,
            &mut lookup,
        )?;
        let max_message_length = parse_with_default(
            "RAGCHAT_MAX_MESSAGE_LENGTH",
            DEFAULT_MAX_MESSAGE_LENGTH,
            &mut lookup,
        )?;
        let echo_window_ms = parse_with_default(
            "RAGCHAT_ECHO_WINDOW_MS",
            DEFAULT_ECHO_WINDOW_MS,
            &mut lookup,
        )?;
        let max_messages =
            parse_with_default("RAGCHAT_MAX_MESSAGES", DEFAULT_MAX_MESSAGES, &mut lookup)?;

        for (key, value) in [
            ("RAGCHAT_REQUEST_TIMEOUT_MS", request_timeout_ms),
            ("RAGCHAT_CONNECT_TIMEOUT_MS", connect_timeout_ms),
            ("RAGCHAT_RECONNECT_DELAY_MS", reconnect_delay_ms),
            ("RAGCHAT_ECHO_WINDOW_MS", echo_window_ms),
        ] {
            ensure_positive(key, value)?;
        }
        ensure_positive("RAGCHAT_MIN_MESSAGE_LENGTH", min_message_length as u64)?;
        ensure_positive("RAGCHAT_MAX_MESSAGES", max_messages as u64)?;

        if min_message_length > max_message_length {
            return Err(ConfigError::InvalidValue {
                key: "RAGCHAT_MAX_MESSAGE_LENGTH",
                value: max_message_length.to_string(),
                reason: format!("must be at least RAGCHAT_MIN_MESSAGE_LENGTH ({min_message_length})"),
            });
        }
        if reconnect_delay_ms > reconnect_delay_max_ms {
            return Err(ConfigError::InvalidValue {
                key: "RAGCHAT_RECONNECT_DELAY_MAX_MS",
                value: reconnect_delay_max_ms.to_string(),
                reason: format!("must be at least RAGCHAT_RECONNECT_DELAY_MS ({reconnect_delay_ms})"),
            });
        }

        Ok(Self {
            api_base_url,
            socket_url,
            enable_socket,
            enable_export,
            debug_logs,
            data_dir,
            request_timeout_ms,
            connect_timeout_ms,
            reconnect_attempts,
            reconnect_delay_ms,
            reconnect_delay_max_ms,
            min_message_length,
            max_message_length,
            echo_window_ms,
            max_messages,
        })
    }

    pub fn rest_config(&self) -> RestClientConfig {
        RestClientConfig {
            timeout: Duration::from_millis(self.request_timeout_ms),
            debug_logs: self.debug_logs,
            ..RestClientConfig::new(self.api_base_url.clone())
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry: RetryPolicy::new(
                self.reconnect_delay_ms,
                self.reconnect_delay_max_ms,
                self.reconnect_attempts,
            ),
            ..RealtimeConfig::new(self.socket_url.clone())
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            echo_window: Duration::from_millis(self.echo_window_ms),
            max_messages: self.max_messages,
        }
    }

    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            min_chars: self.min_message_length,
            max_chars: self.max_message_length,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or failed validation.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn flag_unless_false<F>(key: &'static str, lookup: &mut F) -> bool
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).is_none_or(|value| !value.eq_ignore_ascii_case("false"))
}

fn flag_if_true<F>(key: &'static str, lookup: &mut F) -> bool
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}

fn ensure_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn validate_url(key: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = Url::parse(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<TerminalConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        TerminalConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("empty environment should parse");

        assert_eq!(cfg.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(cfg.socket_url, DEFAULT_API_BASE_URL);
        assert!(cfg.enable_socket);
        assert!(cfg.enable_export);
        assert!(!cfg.debug_logs);
        assert_eq!(cfg.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(cfg.message_limits(), MessageLimits::default());
        assert_eq!(cfg.delivery_config(), DeliveryConfig::default());
        assert_eq!(cfg.realtime_config().retry, RetryPolicy::default());
    }

    #[test]
    fn socket_url_follows_api_url_unless_overridden() {
        let cfg = config_from_pairs(&[("RAGCHAT_API_BASE_URL", " https://chat.example.com ")])
            .expect("config should parse");
        assert_eq!(cfg.socket_url, "https://chat.example.com");

        let cfg = config_from_pairs(&[
            ("RAGCHAT_API_BASE_URL", "https://chat.example.com"),
            ("RAGCHAT_SOCKET_URL", "wss://live.example.com/ws"),
        ])
        .expect("config should parse");
        assert_eq!(cfg.socket_url, "wss://live.example.com/ws");
    }

    #[test]
    fn feature_flags_follow_their_defaults() {
        let cfg = config_from_pairs(&[
            ("RAGCHAT_ENABLE_SOCKET", "false"),
            ("RAGCHAT_ENABLE_EXPORT", "no"),
            ("RAGCHAT_DEBUG_LOGS", "TRUE"),
        ])
        .expect("config should parse");

        assert!(!cfg.enable_socket);
        assert!(cfg.enable_export);
        assert!(cfg.debug_logs);
        assert!(cfg.rest_config().debug_logs);
    }

    #[test]
    fn rejects_unparsable_and_zero_values() {
        let err = config_from_pairs(&[("RAGCHAT_RECONNECT_ATTEMPTS", "many")])
            .expect_err("non-numeric attempts should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RAGCHAT_RECONNECT_ATTEMPTS",
                ..
            }
        ));

        let err = config_from_pairs(&[("RAGCHAT_MAX_MESSAGES", "0")])
            .expect_err("zero retention should fail");
        assert_eq!(
            err.to_string(),
            "invalid RAGCHAT_MAX_MESSAGES='0': must be at least 1"
        );
    }

    #[test]
    fn rejects_inverted_ranges() {
        assert!(
            config_from_pairs(&[
                ("RAGCHAT_MIN_MESSAGE_LENGTH", "50"),
                ("RAGCHAT_MAX_MESSAGE_LENGTH", "10"),
            ])
            .is_err()
        );
        assert!(
            config_from_pairs(&[
                ("RAGCHAT_RECONNECT_DELAY_MS", "9000"),
                ("RAGCHAT_RECONNECT_DELAY_MAX_MS", "1000"),
            ])
            .is_err()
        );
    }

    #[test]
    fn rejects_unsupported_url_schemes() {
        assert!(config_from_pairs(&[("RAGCHAT_API_BASE_URL", "ws://chat.example.com")]).is_err());
        assert!(config_from_pairs(&[("RAGCHAT_SOCKET_URL", "ftp://chat.example.com")]).is_err());
        assert!(config_from_pairs(&[("RAGCHAT_API_BASE_URL", "not a url")]).is_err());
    }

    #[test]
    fn tuning_flows_into_client_configs() {
        let cfg = config_from_pairs(&[
            ("RAGCHAT_REQUEST_TIMEOUT_MS", "1500"),
            ("RAGCHAT_CONNECT_TIMEOUT_MS", "2500"),
            ("RAGCHAT_RECONNECT_ATTEMPTS", "3"),
            ("RAGCHAT_ECHO_WINDOW_MS", "5000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.rest_config().timeout, Duration::from_millis(1_500));
        let realtime = cfg.realtime_config();
        assert_eq!(realtime.connect_timeout, Duration::from_millis(2_500));
        assert_eq!(realtime.retry.max_attempts(), 3);
        assert_eq!(cfg.delivery_config().echo_window, Duration::from_secs(5));
    }
}
