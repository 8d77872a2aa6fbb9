mod bridge;
mod config;
mod logging;
mod state;

use std::{process::ExitCode, sync::Arc};

use bridge::TerminalBridge;
use chat_core::RealtimeTransport;
use chat_platform::{ClientStateStore, FileStore, KeyValueStore};
use chat_remote::{RealtimeClient, RestClient, RuntimeParts, spawn_runtime};
use config::TerminalConfig;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match TerminalConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ragchat-terminal: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.debug_logs);
    info!(
        api_base_url = %config.api_base_url,
        socket_enabled = config.enable_socket,
        data_dir = %config.data_dir.display(),
        "starting ragchat-terminal"
    );

    let rest = match RestClient::new(config.rest_config()) {
        Ok(rest) => rest,
        Err(err) => {
            error!(error = %err, "failed building REST client");
            return ExitCode::FAILURE;
        }
    };

    let transport: Option<Arc<dyn RealtimeTransport>> = if config.enable_socket {
        match RealtimeClient::new(config.realtime_config()) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!(error = %err, "realtime channel disabled");
                None
            }
        }
    } else {
        None
    };

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));
    let client_state = ClientStateStore::new(store);

    let (handle, events) = spawn_runtime(RuntimeParts {
        api: Arc::new(rest.clone()),
        transport,
        client_state: Some(client_state.clone()),
        delivery: config.delivery_config(),
    });

    let bridge = TerminalBridge::spawn(&config, handle, events, rest, client_state);
    let result = bridge.run().await;
    bridge.shutdown();

    match result {
        Ok(()) => {
            info!("ragchat-terminal exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "failed reading input");
            ExitCode::FAILURE
        }
    }
}
