//! WebSocket transport with automatic reconnection.
//!
//! Frames are JSON envelopes `{"event": "<name>", "data": <payload>}`. A single
//! connection task per client owns the socket; the rest of the client talks to
//! it through the outbound queue and the shared state machine.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chat_core::{
    ChatError, ChatErrorCategory, ConnectionState, ConnectionStateMachine, EventHandlers,
    InboundEvent, InboundEventKind, InboundHandler, OutboundEvent, RealtimeTransport, RetryPolicy,
    StateObservers, Subscription, Transition, TransportSignal,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const TRANSITION_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Server URL; `http(s)` is mapped to `ws(s)` and an empty path to `/ws`.
    pub url: String,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub outbound_buffer: usize,
    pub inbound_buffer: usize,
}

impl RealtimeConfig {
    /// Defaults: 20s connect timeout and the default reconnect schedule.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            outbound_buffer: 64,
            inbound_buffer: 256,
        }
    }
}

/// Derive the WebSocket endpoint from a configured server URL.
pub fn realtime_endpoint(raw: &str) -> Result<Url, ChatError> {
    let invalid = |detail: String| {
        ChatError::new(
            ChatErrorCategory::Config,
            "invalid_socket_url",
            format!("invalid socket URL '{raw}': {detail}"),
        )
    };
    let mut url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch scheme".to_owned()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
struct ConnectionSlot {
    /// Bumped by every connect/disconnect; stale tasks cannot move the state.
    epoch: u64,
    machine: ConnectionStateMachine,
}

#[derive(Debug)]
struct RunningConnection {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared {
    endpoint: Url,
    config: RealtimeConfig,
    slot: Mutex<ConnectionSlot>,
    observers: StateObservers,
    state_tx: watch::Sender<ConnectionState>,
    transition_tx: broadcast::Sender<Transition>,
    inbound_tx: broadcast::Sender<InboundEvent>,
    handlers: EventHandlers,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    running: Mutex<Option<RunningConnection>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.slot
            .lock()
            .expect("connection slot lock poisoned")
            .machine
            .state()
    }

    fn attempts(&self) -> u32 {
        self.slot
            .lock()
            .expect("connection slot lock poisoned")
            .machine
            .attempts()
    }

    /// Apply `signal` on behalf of the task started at `epoch`.
    fn signal(&self, epoch: u64, signal: TransportSignal) -> Option<Transition> {
        let transition = {
            let mut slot = self.slot.lock().expect("connection slot lock poisoned");
            if slot.epoch != epoch {
                debug!(?signal, "ignoring signal from stale connection task");
                return None;
            }
            match slot.machine.apply(signal) {
                Ok(transition) => transition,
                Err(err) => {
                    debug!(?signal, error = %err, "ignoring invalid transport signal");
                    None
                }
            }
        }?;
        self.publish_transition(transition);
        Some(transition)
    }

    fn publish_transition(&self, transition: Transition) {
        info!(
            previous = ?transition.previous,
            state = ?transition.next,
            "realtime connection state changed"
        );
        self.state_tx.send_replace(transition.next);
        let _ = self.transition_tx.send(transition);
        self.observers.notify(transition);
    }

    fn deliver(&self, frame: &str) {
        let event = match serde_json::from_str::<InboundEvent>(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping unrecognized realtime frame");
                return;
            }
        };
        debug!(kind = ?event.kind(), "received realtime event");
        self.handlers.dispatch(&event);
        let _ = self.inbound_tx.send(event);
    }
}

/// WebSocket client implementing [`RealtimeTransport`].
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    /// Validate the endpoint. No connection is made until
    /// [`RealtimeTransport::connect`].
    pub fn new(config: RealtimeConfig) -> Result<Self, ChatError> {
        let endpoint = realtime_endpoint(&config.url)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transition_tx, _) = broadcast::channel(TRANSITION_BUFFER);
        let (inbound_tx, _) = broadcast::channel(config.inbound_buffer.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                config,
                slot: Mutex::new(ConnectionSlot::default()),
                observers: StateObservers::default(),
                state_tx,
                transition_tx,
                inbound_tx,
                handlers: EventHandlers::default(),
                outbound: Mutex::new(None),
                running: Mutex::new(None),
            }),
        })
    }

    /// Resolved `ws`/`wss` endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    /// Register a synchronous observer for every state transition.
    pub fn add_state_observer(&self, observer: impl Fn(Transition) + Send + Sync + 'static) -> u64 {
        self.shared.observers.add(observer)
    }

    /// Returns whether an observer with `id` was registered.
    pub fn remove_state_observer(&self, id: u64) -> bool {
        self.shared.observers.remove(id)
    }
}

impl RealtimeTransport for RealtimeClient {
    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn publish(&self, event: OutboundEvent) -> bool {
        if !self.shared.state().is_connected() {
            return false;
        }
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed encoding outbound event");
                return false;
            }
        };
        let outbound = self
            .shared
            .outbound
            .lock()
            .expect("outbound slot lock poisoned");
        match outbound.as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    fn subscribe(&self, kind: InboundEventKind, handler: InboundHandler) -> Subscription {
        self.shared.handlers.subscribe(kind, handler)
    }

    fn events(&self) -> broadcast::Receiver<InboundEvent> {
        self.shared.inbound_tx.subscribe()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.shared.transition_tx.subscribe()
    }

    fn connect(&self) {
        let (epoch, transition) = {
            let mut slot = self
                .shared
                .slot
                .lock()
                .expect("connection slot lock poisoned");
            match slot.machine.apply(TransportSignal::Connect) {
                Ok(Some(transition)) => {
                    slot.epoch += 1;
                    (slot.epoch, transition)
                }
                _ => {
                    debug!("connect ignored; connection task already active");
                    return;
                }
            }
        };
        self.shared.publish_transition(transition);

        let stop = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            epoch,
            stop.child_token(),
        ));
        let previous = self
            .shared
            .running
            .lock()
            .expect("running connection lock poisoned")
            .replace(RunningConnection { stop, task });
        if let Some(previous) = previous {
            previous.stop.cancel();
        }
    }

    fn disconnect(&self) {
        let transition = {
            let mut slot = self
                .shared
                .slot
                .lock()
                .expect("connection slot lock poisoned");
            slot.epoch += 1;
            slot.machine.apply(TransportSignal::Disconnect).ok().flatten()
        };

        if let Some(running) = self
            .shared
            .running
            .lock()
            .expect("running connection lock poisoned")
            .take()
        {
            running.stop.cancel();
            drop(running.task);
        }
        self.shared
            .outbound
            .lock()
            .expect("outbound slot lock poisoned")
            .take();
        self.shared.handlers.clear();

        if let Some(transition) = transition {
            self.shared.publish_transition(transition);
        }
    }
}

enum SessionEnd {
    Stopped,
    Closed,
    Failed(String),
}

async fn connection_loop(shared: Arc<Shared>, epoch: u64, stop: CancellationToken) {
    let retry = shared.config.retry;
    loop {
        let attempt = tokio::select! {
            _ = stop.cancelled() => break,
            result = tokio::time::timeout(
                shared.config.connect_timeout,
                connect_async(shared.endpoint.as_str()),
            ) => result,
        };

        match attempt {
            Ok(Ok((socket, _response))) => {
                let (out_tx, out_rx) = mpsc::channel(shared.config.outbound_buffer.max(1));
                *shared.outbound.lock().expect("outbound slot lock poisoned") = Some(out_tx);
                if shared.signal(epoch, TransportSignal::Opened).is_none() && stop.is_cancelled() {
                    break;
                }

                let end = run_session(&shared, socket, out_rx, &stop).await;
                shared
                    .outbound
                    .lock()
                    .expect("outbound slot lock poisoned")
                    .take();
                match end {
                    SessionEnd::Stopped => break,
                    SessionEnd::Closed => {
                        info!(endpoint = %shared.endpoint, "realtime connection closed by server");
                        shared.signal(epoch, TransportSignal::Lost);
                    }
                    SessionEnd::Failed(reason) => {
                        warn!(endpoint = %shared.endpoint, error = %reason, "realtime connection failed");
                        shared.signal(epoch, TransportSignal::Failed);
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(endpoint = %shared.endpoint, error = %err, "realtime connect failed");
                shared.signal(epoch, TransportSignal::Failed);
            }
            Err(_) => {
                warn!(
                    endpoint = %shared.endpoint,
                    timeout_ms = shared.config.connect_timeout.as_millis() as u64,
                    "realtime connect timed out"
                );
                shared.signal(epoch, TransportSignal::Failed);
            }
        }

        let attempt = shared.attempts();
        if !retry.allows_attempt(attempt) {
            warn!(attempts = attempt, "realtime reconnection attempts exhausted");
            shared.signal(epoch, TransportSignal::Exhausted);
            break;
        }

        let delay = retry.delay_for_attempt(attempt);
        if shared.signal(epoch, TransportSignal::RetryScheduled).is_none()
            && shared.state() != ConnectionState::Reconnecting
        {
            // superseded by disconnect()
            break;
        }
        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling realtime reconnect"
        );
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(endpoint = %shared.endpoint, "realtime connection task finished");
}

async fn run_session(
    shared: &Shared,
    socket: Socket,
    mut out_rx: mpsc::Receiver<String>,
    stop: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Stopped;
            }
            outbound = out_rx.recv() => {
                let Some(frame) = outbound else {
                    return SessionEnd::Stopped;
                };
                if let Err(err) = sink.send(Message::Text(frame.into())).await {
                    return SessionEnd::Failed(err.to_string());
                }
            }
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.deliver(text.as_str()),
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Failed(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_urls_to_websocket_endpoints() {
        assert_eq!(
            realtime_endpoint("http://localhost:5000")
                .expect("valid url")
                .as_str(),
            "ws://localhost:5000/ws"
        );
        assert_eq!(
            realtime_endpoint("https://chat.example.com/socket")
                .expect("valid url")
                .as_str(),
            "wss://chat.example.com/socket"
        );
        assert_eq!(
            realtime_endpoint("ws://127.0.0.1:9000/")
                .expect("valid url")
                .as_str(),
            "ws://127.0.0.1:9000/ws"
        );
    }

    #[test]
    fn rejects_unsupported_socket_schemes() {
        let err = realtime_endpoint("ftp://example.com").expect_err("ftp is not a socket url");
        assert_eq!(err.code, "invalid_socket_url");
    }

    #[tokio::test]
    async fn publish_is_refused_while_disconnected() {
        let client =
            RealtimeClient::new(RealtimeConfig::new("http://127.0.0.1:9")).expect("client builds");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.publish(OutboundEvent::Ping(1)));
    }

    #[tokio::test]
    async fn disconnect_drops_registered_handlers() {
        let client =
            RealtimeClient::new(RealtimeConfig::new("http://127.0.0.1:9")).expect("client builds");
        let _sub = client.subscribe(InboundEventKind::Pong, Box::new(|_| {}));
        client.disconnect();
        assert!(client.shared.handlers.is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
