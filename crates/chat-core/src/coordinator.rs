//! Delivery coordination for the active session.
//!
//! The coordinator owns the canonical message list. Each send goes over the
//! real-time channel when it is connected and accepts the publish, and falls
//! back to the request/response API otherwise. Optimistic entries are always
//! resolved: replaced by a confirmed message, swapped for a finalized pair, or
//! removed.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{FutureExt, future::BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    normalization::{normalize_rest_reply, normalize_send_failure},
    timeline::{MessageLog, MessageOp},
    transport::{ChatApi, RealtimeTransport},
    types::{
        ChatMessage, ChatReply, ConnectionState, InboundEvent, MessageRole, Notice,
        OutboundEvent, SendMessagePayload, local_id,
    },
};

pub const CANCELLED_NOTICE: &str = "Message cancelled";
pub const SESSION_CLEARED_NOTICE: &str = "Chat history cleared.";
pub const RECONNECTED_NOTICE: &str = "Reconnected to chat server.";
pub const RECONNECT_FAILED_NOTICE: &str = "Unable to reconnect to chat server.";
pub const CONNECT_FAILED_NOTICE: &str = "Failed to connect to chat server.";
pub const HISTORY_FAILED: &str = "Failed to load chat history";

/// Tuning for the delivery coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Max distance between a client-generated entry and the server message
    /// confirming it.
    pub echo_window: Duration,
    /// Retention cap for the message list.
    pub max_messages: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            echo_window: Duration::from_secs(60),
            max_messages: 1_000,
        }
    }
}

/// Route picked for one send.
#[derive(Debug)]
pub enum Dispatch {
    /// Published over the real-time channel; the echo resolves it.
    Realtime { optimistic_id: String },
    /// Must be executed through [`DeliveryCoordinator::rest_future`].
    Rest(RestSend),
}

/// Ticket for a request/response send that is in flight.
#[derive(Debug, Clone)]
pub struct RestSend {
    pub ticket: u64,
    pub optimistic_id: String,
    pub content: String,
    pub cancel: CancellationToken,
}

/// Completed request/response send, fed back through
/// [`DeliveryCoordinator::finish_rest_send`].
#[derive(Debug)]
pub struct RestOutcome {
    pub ticket: u64,
    pub content: String,
    pub result: Result<ChatReply, ChatError>,
}

/// How a clear request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearRoute {
    /// `clear_session` published; the list empties on `session_cleared`.
    Realtime,
    /// Cleared locally after a best-effort server call.
    Local,
}

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    optimistic_id: String,
    cancel: CancellationToken,
    /// Confirmations that arrived over the real-time channel meanwhile.
    confirmed: Vec<(MessageRole, String)>,
}

pub struct DeliveryCoordinator {
    session_id: String,
    api: Arc<dyn ChatApi>,
    transport: Option<Arc<dyn RealtimeTransport>>,
    config: DeliveryConfig,
    log: MessageLog,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    /// Optimistic ids published over the real-time channel, awaiting their echo.
    pending_echo: Vec<String>,
    bot_typing: bool,
    last_error: Option<String>,
    notices: Vec<Notice>,
    revision: u64,
    latency_ms: Option<i64>,
    connection: ConnectionState,
    ever_connected: bool,
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("session_id", &self.session_id)
            .field("messages", &self.log.len())
            .field("in_flight", &self.in_flight.as_ref().map(|f| f.ticket))
            .field("bot_typing", &self.bot_typing)
            .field("connection", &self.connection)
            .finish()
    }
}

impl DeliveryCoordinator {
    /// Start with an empty list. History is loaded separately with
    /// [`Self::load_history`].
    pub fn new(
        session_id: impl Into<String>,
        api: Arc<dyn ChatApi>,
        transport: Option<Arc<dyn RealtimeTransport>>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            api,
            transport,
            config,
            log: MessageLog::new(config.max_messages),
            in_flight: None,
            next_ticket: 0,
            pending_echo: Vec::new(),
            bot_typing: false,
            last_error: None,
            notices: Vec::new(),
            revision: 0,
            latency_ms: None,
            connection: ConnectionState::Disconnected,
            ever_connected: false,
        }
    }

    /// Session every send and history request targets.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Message list in display order, optimistic entries included.
    pub fn messages(&self) -> &[ChatMessage] {
        self.log.messages()
    }

    /// Bumped on every change of the message list.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// A send is in flight or the bot is typing.
    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some() || self.bot_typing
    }

    /// A send is awaiting its reply; new sends are refused meanwhile.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// User-facing text of the latest failure, cleared by the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Round-trip time of the last answered ping.
    pub fn latency_ms(&self) -> Option<i64> {
        self.latency_ms
    }

    /// Live transport state; `Disconnected` without a transport.
    pub fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map(|transport| transport.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Take the queued transient notifications.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Start delivering `content`: append the optimistic entry and pick a route.
    pub fn begin_send(&mut self, content: &str) -> Result<Dispatch, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::validation(
                "empty_message",
                "Please enter a message.",
            ));
        }
        if self.is_loading() {
            let err = ChatError::busy();
            self.notices.push(Notice::error(err.message.clone()));
            return Err(err);
        }

        self.last_error = None;
        let optimistic = ChatMessage::optimistic_user(content);
        let optimistic_id = optimistic.id.clone();
        self.apply(&[MessageOp::Append(optimistic)]);

        if self.publish(OutboundEvent::SendMessage(SendMessagePayload {
            session_id: self.session_id.clone(),
            message: content.to_owned(),
        })) {
            debug!(message_id = %optimistic_id, "message published over realtime channel");
            self.pending_echo.push(optimistic_id.clone());
            return Ok(Dispatch::Realtime { optimistic_id });
        }

        self.next_ticket += 1;
        let send = RestSend {
            ticket: self.next_ticket,
            optimistic_id: optimistic_id.clone(),
            content: content.to_owned(),
            cancel: CancellationToken::new(),
        };
        self.in_flight = Some(InFlight {
            ticket: send.ticket,
            optimistic_id,
            cancel: send.cancel.clone(),
            confirmed: Vec::new(),
        });
        debug!(message_id = %send.optimistic_id, ticket = send.ticket, "falling back to rest send");
        Ok(Dispatch::Rest(send))
    }

    /// Future performing the request/response call for `send`.
    pub fn rest_future(&self, send: &RestSend) -> BoxFuture<'static, RestOutcome> {
        let api = Arc::clone(&self.api);
        let session_id = self.session_id.clone();
        let ticket = send.ticket;
        let content = send.content.clone();
        let cancel = send.cancel.clone();
        async move {
            let result = api.send_message(&session_id, &content, cancel).await;
            RestOutcome {
                ticket,
                content,
                result,
            }
        }
        .boxed()
    }

    /// Resolve a request/response send. Returns `false` for stale outcomes.
    pub fn finish_rest_send(&mut self, outcome: RestOutcome) -> bool {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.ticket == outcome.ticket => in_flight,
            other => {
                self.in_flight = other;
                debug!(ticket = outcome.ticket, "ignoring stale rest outcome");
                return false;
            }
        };

        let mut ops = Vec::with_capacity(3);
        if self.log.contains(&in_flight.optimistic_id) {
            ops.push(MessageOp::Remove {
                id: in_flight.optimistic_id.clone(),
            });
        }

        match outcome.result {
            Ok(reply) => {
                let (user, bot) = normalize_rest_reply(&outcome.content, reply);
                for message in [user, bot] {
                    let key = (message.role, message.content.trim().to_owned());
                    if in_flight.confirmed.contains(&key) {
                        debug!(role = ?message.role, "reply already confirmed over realtime channel");
                        continue;
                    }
                    ops.push(MessageOp::Append(message));
                }
                info!(session_id = %self.session_id, "rest send completed");
            }
            Err(err) if err.is_cancelled() => {
                debug!(ticket = outcome.ticket, "rest send cancelled");
            }
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "rest send failed");
                let text = err.user_message();
                ops.push(MessageOp::Append(normalize_send_failure(&err)));
                self.notices.push(Notice::error(text.clone()));
                self.last_error = Some(text);
            }
        }

        self.apply(&ops);
        true
    }

    /// Send and wait for resolution, for callers without their own poll loop.
    pub async fn send(&mut self, content: &str) -> Result<(), ChatError> {
        if let Dispatch::Rest(send) = self.begin_send(content)? {
            let outcome = self.rest_future(&send).await;
            self.finish_rest_send(outcome);
        }
        Ok(())
    }

    /// Abort the in-flight request/response send.
    ///
    /// The optimistic entry is removed and no list entry is added.
    pub fn cancel(&mut self) -> bool {
        let Some(in_flight) = self.in_flight.take() else {
            return false;
        };
        in_flight.cancel.cancel();
        if self.log.contains(&in_flight.optimistic_id) {
            self.apply(&[MessageOp::Remove {
                id: in_flight.optimistic_id,
            }]);
        }
        self.notices.push(Notice::success(CANCELLED_NOTICE));
        info!(session_id = %self.session_id, "send cancelled");
        true
    }

    /// Resubmit the most recent user-authored content.
    pub fn retry_last_message(&mut self) -> Result<Dispatch, ChatError> {
        let Some(content) = self.log.last_user_content().map(str::to_owned) else {
            return Err(ChatError::validation(
                "nothing_to_retry",
                "There is no message to retry.",
            ));
        };
        self.begin_send(&content)
    }

    /// Clear the conversation.
    ///
    /// Over the real-time channel the list empties when the server confirms.
    /// Otherwise the server is asked over REST and the list is cleared locally
    /// whether or not that request succeeds.
    pub async fn clear_chat(&mut self) -> ClearRoute {
        if self.publish(OutboundEvent::ClearSession(self.session_id.clone())) {
            return ClearRoute::Realtime;
        }

        if let Err(err) = self.api.clear_session(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %err, "server clear failed; clearing locally");
        }
        self.clear_local();
        ClearRoute::Local
    }

    /// Replace the list with the server history.
    ///
    /// A failure leaves the list untouched and records the error without a notice.
    pub async fn load_history(&mut self) -> Result<usize, ChatError> {
        match self.api.fetch_history(&self.session_id).await {
            Ok(messages) => {
                let count = messages.len();
                self.last_error = None;
                self.apply(&[MessageOp::Reset(messages)]);
                Ok(count)
            }
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "failed to load chat history");
                self.last_error = Some(HISTORY_FAILED.to_owned());
                Err(err)
            }
        }
    }

    /// Send a latency ping. Returns `false` when not connected.
    pub fn ping(&mut self) -> bool {
        self.publish(OutboundEvent::Ping(Utc::now().timestamp_millis()))
    }

    /// React to a connection state change reported by the transport.
    pub fn on_connection_changed(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.connection, state);
        if previous == state {
            return;
        }

        match state {
            ConnectionState::Connected => {
                if self.ever_connected {
                    self.notices.push(Notice::success(RECONNECTED_NOTICE));
                }
                self.ever_connected = true;
                let joined = self.publish(OutboundEvent::JoinSession(self.session_id.clone()));
                debug!(session_id = %self.session_id, joined, "joined session on realtime channel");
            }
            ConnectionState::Disconnected
                if matches!(
                    previous,
                    ConnectionState::Reconnecting | ConnectionState::Error
                ) =>
            {
                let text = if self.ever_connected {
                    RECONNECT_FAILED_NOTICE
                } else {
                    CONNECT_FAILED_NOTICE
                };
                self.notices.push(Notice::error(text));
            }
            _ => {}
        }
    }

    /// Apply one event received over the real-time channel.
    pub fn apply_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::SessionHistory(messages) => {
                debug!(count = messages.len(), "received session history");
                self.pending_echo.clear();
                self.apply(&[MessageOp::Reset(messages)]);
            }
            InboundEvent::NewMessage(message) => {
                self.bot_typing = false;
                self.reconcile(message);
            }
            InboundEvent::BotTyping(typing) => self.bot_typing = typing,
            InboundEvent::SessionCleared => {
                self.clear_local();
            }
            InboundEvent::Error(text) => {
                warn!(session_id = %self.session_id, error = %text, "realtime channel reported error");
                self.bot_typing = false;
                self.notices.push(Notice::error(text.clone()));
                self.last_error = Some(text);
            }
            InboundEvent::Pong(sent_at) => {
                let millis = Utc::now().timestamp_millis().saturating_sub(sent_at).max(0);
                self.latency_ms = Some(millis);
            }
        }
    }

    fn reconcile(&mut self, message: ChatMessage) {
        if self.log.contains(&message.id) {
            debug!(message_id = %message.id, "dropping duplicate message");
            return;
        }

        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight
                .confirmed
                .push((message.role, message.content.trim().to_owned()));
        }

        let window = chrono::Duration::from_std(self.config.echo_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let correlated = self
            .log
            .find_correlated(message.role, &message.content, message.timestamp, window)
            .map(|existing| existing.id.clone());

        let is_bot_reply = message.role == MessageRole::Bot;
        let mut ops = match correlated {
            Some(id) => {
                debug!(local_id = %id, server_id = %message.id, "replacing client entry with confirmed message");
                self.pending_echo.retain(|pending| *pending != id);
                vec![MessageOp::Replace { id, message }]
            }
            None => vec![MessageOp::Append(message)],
        };

        if is_bot_reply {
            // the answer resolves any echo that never arrived
            for pending in std::mem::take(&mut self.pending_echo) {
                if let Some(entry) = self.log.get(&pending) {
                    let mut promoted = entry.clone();
                    promoted.id = local_id(promoted.role);
                    ops.push(MessageOp::Replace {
                        id: pending,
                        message: promoted,
                    });
                }
            }
        }

        self.apply(&ops);
    }

    fn clear_local(&mut self) {
        self.pending_echo.clear();
        self.bot_typing = false;
        self.apply(&[MessageOp::Clear]);
        self.notices.push(Notice::success(SESSION_CLEARED_NOTICE));
        info!(session_id = %self.session_id, "session cleared");
    }

    fn publish(&self, event: OutboundEvent) -> bool {
        match self.transport.as_ref() {
            Some(transport) if transport.state().is_connected() => transport.publish(event),
            _ => false,
        }
    }

    fn apply(&mut self, ops: &[MessageOp]) {
        if ops.is_empty() {
            return;
        }
        match self.log.apply_ops(ops) {
            Ok(()) => self.revision += 1,
            Err(err) => warn!(session_id = %self.session_id, error = %err, "rejected message list update"),
        }
    }
}
