use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChatCommand, ChatEvent};

pub const DEFAULT_COMMAND_BUFFER: usize = 64;
pub const DEFAULT_EVENT_BUFFER: usize = 512;

/// Receiver side handed to each presentation subscriber.
pub type EventStream = broadcast::Receiver<ChatEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatChannelError {
    /// The runtime dropped its command receiver.
    #[error("chat runtime is no longer accepting commands")]
    RuntimeStopped,
}

/// Commands flow in over `mpsc`; events fan out over `broadcast`.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    commands: mpsc::Sender<ChatCommand>,
    events: EventEmitter,
}

/// Publishing half of [`ChatChannels`]. Holds no command sender, so the
/// command receiver closes once every [`ChatChannels`] clone is gone.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    events: broadcast::Sender<ChatEvent>,
}

impl EventEmitter {
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("chat event dropped; no subscribers");
        }
    }
}

impl ChatChannels {
    pub fn new() -> (Self, mpsc::Receiver<ChatCommand>) {
        Self::with_capacity(DEFAULT_COMMAND_BUFFER, DEFAULT_EVENT_BUFFER)
    }

    /// Both capacities are raised to at least one.
    pub fn with_capacity(
        command_capacity: usize,
        event_capacity: usize,
    ) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (commands, command_rx) = mpsc::channel(command_capacity.max(1));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let events = EventEmitter { events };
        (Self { commands, events }, command_rx)
    }

    /// Clone the event side for the task that owns the command receiver.
    pub fn emitter(&self) -> EventEmitter {
        self.events.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Queue a command, waiting while the runtime's buffer is full.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatChannelError::RuntimeStopped)
    }

    pub fn emit(&self, event: ChatEvent) {
        self.events.emit(event);
    }
}
