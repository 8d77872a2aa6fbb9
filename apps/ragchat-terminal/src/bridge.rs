//! Terminal bridge: turns input lines into runtime commands and runtime
//! events into printed lines.

use std::{
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use chat_core::{ChatCommand, EventStream, ExportFormat, ExportedTranscript, MessageLimits};
use chat_platform::PreferencesPatch;
use chat_remote::{ChatRuntimeHandle, RestClient, SharedClientState};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{config::TerminalConfig, state::TerminalState};

const HELP: &str = "\
Commands:
  /retry              resend the last message
  /cancel             cancel the pending message
  /clear              clear the conversation
  /history            reload history from the server
  /ping               measure real-time latency
  /stats              show session statistics
  /health             check backend health
  /export <format>    export the session (json, csv, txt)
  /prefs [key=value]  show or update preferences
  /help               show this help
  /quit               exit
Anything else is sent as a message.";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Send(String),
    Runtime(ChatCommand),
    Stats,
    Health,
    Export(ExportFormat),
    ShowPreferences,
    UpdatePreferences(PreferencesPatch),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`; the error is the text
/// to show the user.
pub fn parse_input(line: &str, limits: &MessageLimits) -> Result<Option<InputAction>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let Some(command) = trimmed.strip_prefix('/') else {
        let content = limits.validate(trimmed).map_err(|err| err.message)?;
        return Ok(Some(InputAction::Send(content.to_owned())));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };
    let action = match name.to_ascii_lowercase().as_str() {
        "retry" => InputAction::Runtime(ChatCommand::RetryLast),
        "cancel" => InputAction::Runtime(ChatCommand::Cancel),
        "clear" => InputAction::Runtime(ChatCommand::Clear),
        "history" => InputAction::Runtime(ChatCommand::ReloadHistory),
        "ping" => InputAction::Runtime(ChatCommand::Ping),
        "stats" => InputAction::Stats,
        "health" => InputAction::Health,
        "export" => {
            let format = if argument.is_empty() {
                ExportFormat::Json
            } else {
                argument.parse::<ExportFormat>()?
            };
            InputAction::Export(format)
        }
        "prefs" if argument.is_empty() => InputAction::ShowPreferences,
        "prefs" => InputAction::UpdatePreferences(PreferencesPatch::parse_assignment(argument)?),
        "help" => InputAction::Help,
        "quit" | "exit" => InputAction::Quit,
        other => return Err(format!("Unknown command '/{other}'. Type /help for commands.")),
    };
    Ok(Some(action))
}

/// Wires the runtime handle, REST client and local state to the terminal.
pub struct TerminalBridge {
    handle: ChatRuntimeHandle,
    rest: RestClient,
    client_state: SharedClientState,
    state: Arc<Mutex<TerminalState>>,
    limits: MessageLimits,
    enable_export: bool,
    export_dir: PathBuf,
    event_task: JoinHandle<()>,
}

impl TerminalBridge {
    /// Start printing runtime events.
    pub fn spawn(
        config: &TerminalConfig,
        handle: ChatRuntimeHandle,
        events: EventStream,
        rest: RestClient,
        client_state: SharedClientState,
    ) -> Self {
        let mut terminal_state = TerminalState::new(config.enable_socket);
        terminal_state.set_compact_mode(client_state.preferences().compact_mode);
        let state = Arc::new(Mutex::new(terminal_state));
        let event_task = tokio::spawn(print_events(events, Arc::clone(&state)));

        Self {
            handle,
            rest,
            client_state,
            state,
            limits: config.message_limits(),
            enable_export: config.enable_export,
            export_dir: PathBuf::from("."),
            event_task,
        }
    }

    /// Read stdin until `/quit` or end of input.
    pub async fn run(&self) -> io::Result<()> {
        println!("Type a message, or /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if !self.handle_line(&line).await {
                break;
            }
        }
        Ok(())
    }

    pub fn shutdown(self) {
        self.event_task.abort();
    }

    /// Returns `false` once the user asked to quit.
    async fn handle_line(&self, line: &str) -> bool {
        let action = match parse_input(line, &self.limits) {
            Ok(Some(action)) => action,
            Ok(None) => return true,
            Err(text) => {
                println!("! {text}");
                return true;
            }
        };
        debug!(?action, "terminal input");

        match action {
            InputAction::Send(content) => self.forward(ChatCommand::Send { content }).await,
            InputAction::Runtime(command) => self.forward(command).await,
            InputAction::Stats => self.print_stats().await,
            InputAction::Health => self.print_health().await,
            InputAction::Export(format) => self.export(format).await,
            InputAction::ShowPreferences => {
                let preferences = self.client_state.preferences();
                match serde_json::to_string_pretty(&preferences) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => println!("! Failed to render preferences: {err}"),
                }
            }
            InputAction::UpdatePreferences(patch) => {
                match self.client_state.update_preferences(&patch) {
                    Ok(preferences) => {
                        self.state
                            .lock()
                            .expect("terminal state lock poisoned")
                            .set_compact_mode(preferences.compact_mode);
                        println!("+ Preferences updated.");
                    }
                    Err(err) => {
                        warn!(error = %err, "failed saving preferences");
                        println!("! Failed to save preferences.");
                    }
                }
            }
            InputAction::Help => println!("{HELP}"),
            InputAction::Quit => return false,
        }
        true
    }

    async fn forward(&self, command: ChatCommand) {
        if let Err(err) = self.handle.send(command).await {
            warn!(error = %err, "chat runtime unavailable");
            println!("! Chat runtime stopped.");
        }
    }

    fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("terminal state lock poisoned")
            .session_id()
            .map(str::to_owned)
    }

    async fn print_stats(&self) {
        let snapshot = self
            .state
            .lock()
            .expect("terminal state lock poisoned")
            .snapshot();
        let Some(session_id) = snapshot.session_id else {
            println!("! No active session yet.");
            return;
        };
        let origin = if snapshot.fallback_session {
            "offline"
        } else {
            "server"
        };
        println!("  session: {session_id} ({origin})");
        println!("  status: {}", snapshot.status_text);
        println!("  loading: {}", snapshot.loading);
        println!("  messages shown: {}", snapshot.messages.len());
        if let Some(millis) = snapshot.latency_ms {
            println!("  latency: {millis} ms");
        }
        if let Some(error) = &snapshot.error_text {
            println!("  last error: {error}");
        }

        match self.rest.session_stats(&session_id).await {
            Ok(stats) => {
                for (key, value) in stats.counters {
                    println!("  {key}: {value}");
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed loading session stats");
                let metadata = self.client_state.session_metadata(&session_id);
                println!(
                    "  messages: {} (user {}, bot {}) [local backup]",
                    metadata.message_count, metadata.user_messages, metadata.bot_messages
                );
            }
        }
    }

    async fn print_health(&self) {
        let report = self.rest.test_connection().await;
        if report.success {
            println!(
                "+ Backend {}",
                report.status.as_deref().unwrap_or("reachable")
            );
            if let Some(services) = report.services {
                println!("  {services}");
            }
        } else {
            println!(
                "! Backend unreachable: {}",
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    async fn export(&self, format: ExportFormat) {
        if !self.enable_export {
            println!("! Export is disabled.");
            return;
        }
        let Some(session_id) = self.session_id() else {
            println!("! No active session yet.");
            return;
        };

        let transcript = match self.rest.export_session(&session_id, format).await {
            Ok(transcript) => transcript,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "server export failed; using local backup");
                match self.client_state.export_local(&session_id, format) {
                    Ok(transcript) => transcript,
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "local export failed");
                        println!("! Failed to export session: {err}");
                        return;
                    }
                }
            }
        };
        let body = match transcript {
            ExportedTranscript::Json(value) => match serde_json::to_string_pretty(&value) {
                Ok(body) => body,
                Err(err) => {
                    println!("! Failed to render export: {err}");
                    return;
                }
            },
            ExportedTranscript::Text(body) => body,
        };

        let path = self
            .export_dir
            .join(format!("chat-session-{session_id}.{}", format.as_str()));
        match fs::write(&path, body) {
            Ok(()) => {
                info!(path = %path.display(), "exported session");
                println!("+ Exported to {}", path.display());
            }
            Err(err) => println!("! Failed to write {}: {err}", path.display()),
        }
    }
}

async fn print_events(mut events: EventStream, state: Arc<Mutex<TerminalState>>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let lines = state
                    .lock()
                    .expect("terminal state lock poisoned")
                    .handle_event(event);
                for line in lines {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "terminal lagged behind chat events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use chat_platform::Theme;

    use super::*;

    fn parse(line: &str) -> Result<Option<InputAction>, String> {
        parse_input(line, &MessageLimits::default())
    }

    #[test]
    fn plain_lines_are_validated_messages() {
        assert_eq!(
            parse("  what moved markets?  ").expect("valid message"),
            Some(InputAction::Send("what moved markets?".to_owned()))
        );
        assert_eq!(parse("   ").expect("blank input"), None);
        assert_eq!(
            parse("hi").expect_err("too short"),
            "Message too short. Please enter at least 3 characters."
        );
        assert_eq!(
            parse(&"x".repeat(1_001)).expect_err("too long"),
            "Message too long. Please keep it under 1000 characters."
        );
    }

    #[test]
    fn slash_commands_map_to_actions() {
        assert_eq!(
            parse("/retry").expect("retry"),
            Some(InputAction::Runtime(ChatCommand::RetryLast))
        );
        assert_eq!(
            parse("/CANCEL").expect("cancel"),
            Some(InputAction::Runtime(ChatCommand::Cancel))
        );
        assert_eq!(
            parse("/export csv").expect("export"),
            Some(InputAction::Export(ExportFormat::Csv))
        );
        assert_eq!(
            parse("/export").expect("default export"),
            Some(InputAction::Export(ExportFormat::Json))
        );
        assert_eq!(parse("/quit").expect("quit"), Some(InputAction::Quit));
        assert_eq!(parse("/prefs").expect("prefs"), Some(InputAction::ShowPreferences));
    }

    #[test]
    fn preference_updates_are_parsed() {
        let Some(InputAction::UpdatePreferences(patch)) =
            parse("/prefs theme=dark").expect("prefs update")
        else {
            panic!("expected preference update");
        };
        assert_eq!(patch.theme, Some(Theme::Dark));
        assert!(parse("/prefs volume=11").is_err());
    }

    #[test]
    fn short_commands_skip_message_validation() {
        assert_eq!(
            parse("/ping").expect("ping"),
            Some(InputAction::Runtime(ChatCommand::Ping))
        );
        assert!(parse("/nope").is_err());
        assert!(parse("/export pdf").is_err());
    }
}
