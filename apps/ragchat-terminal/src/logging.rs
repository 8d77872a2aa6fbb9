//! Tracing/logging bootstrap for the terminal client.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,ragchat_terminal=info,chat_remote=info,chat_core=info";
const DEBUG_FILTER: &str = "info,ragchat_terminal=debug,chat_remote=debug,chat_core=debug";

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `RAGCHAT_TERMINAL_LOG`
/// 3) `RAGCHAT_LOG`
/// 4) internal default filter, raised to debug by `RAGCHAT_DEBUG_LOGS`
pub fn init(debug_logs: bool) {
    let env_filter = filter_from_env(debug_logs);
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env(debug_logs: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["RAGCHAT_TERMINAL_LOG", "RAGCHAT_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(default_filter(debug_logs))
}

fn default_filter(debug_logs: bool) -> &'static str {
    if debug_logs { DEBUG_FILTER } else { DEFAULT_FILTER }
}
