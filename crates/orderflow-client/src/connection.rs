use crate::router::{EventRouter, Handler, RoutedEvent, Subscription};
use crate::{lock, ConnectionError};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use orderflow_core::wire::{
    decode_envelope, encode_outbound, event_types, heartbeat_payload, ErrorKind, FrameError,
    DEFAULT_MAX_FRAME_BYTES,
};
use orderflow_core::{ConnectionState, ConnectionStatus, Envelope};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const CLEAN_CLOSE_CODE: u16 = 1000;
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;
const NO_STATUS_CLOSE_CODE: u16 = 1005;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// The contract shared by the live connection and the simulated source.
pub trait EventSource: Send + Sync {
    /// No-op while already connected or connecting.
    fn connect(&self);
    /// Clean close; no reconnection follows.
    fn disconnect(&self);
    /// Stamp and send. False unless the transport is open.
    fn send_message(&self, payload: Value) -> bool;
    fn subscribe(&self, event_type: &str, handler: Handler) -> Subscription;
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
    }
}

/// Supplies session state to attach to the synthetic `connected` event.
pub trait RecoveryProvider: Send + Sync {
    fn recovery_data(&self, client_id: &str) -> Option<Value>;
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub client_id: String,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub max_frame_bytes: usize,
}

impl ConnectionConfig {
    pub fn new(url: &str, client_id: impl Into<String>) -> Result<Self, ConnectionError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            url,
            client_id: client_id.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }
}

/// `base × 2^attempt`, with the exponent capped.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
}

/// Connection state plus the router, shared by every event source.
pub(crate) struct SourceCore {
    router: EventRouter,
    state: Mutex<ConnectionState>,
    max_frame_bytes: usize,
}

impl SourceCore {
    pub(crate) fn new(client_id: String, max_frame_bytes: usize) -> Self {
        Self {
            router: EventRouter::new(),
            state: Mutex::new(ConnectionState::new(client_id)),
            max_frame_bytes,
        }
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.router
    }

    pub(crate) fn snapshot(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    pub(crate) fn client_id(&self) -> String {
        lock(&self.state).client_id.clone()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        lock(&self.state).status = status;
    }

    pub(crate) fn mark_open(&self) {
        let mut state = lock(&self.state);
        state.status = ConnectionStatus::Connected;
        state.stats.connected_at = Some(Utc::now());
        state.stats.reconnect_attempts = 0;
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        lock(&self.state).stats.reconnect_attempts = attempts;
    }

    pub(crate) fn record_sent(&self) {
        lock(&self.state).stats.messages_sent += 1;
    }

    /// Locally generated events skip the inbound counters.
    pub(crate) fn emit_local(&self, envelope: Envelope) {
        self.router.dispatch(&RoutedEvent::new(envelope));
    }

    pub(crate) fn emit_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!(event = "connection_diagnostic", error_type = kind.as_str(), message = %message);
        self.emit_local(Envelope::error(kind, message));
    }

    pub(crate) fn emit_connected(&self, recovery_data: Option<Value>) {
        let client_id = self.client_id();
        self.emit_local(Envelope::new(
            event_types::CONNECTED,
            json!({
                "client_id": client_id,
                "has_recovery_data": recovery_data.is_some(),
                "recovery_data": recovery_data,
            }),
        ));
    }

    pub(crate) fn emit_disconnected(&self, code: u16, reason: &str, will_reconnect: bool) {
        self.emit_local(Envelope::new(
            event_types::DISCONNECTED,
            json!({
                "code": code,
                "reason": reason,
                "will_reconnect": will_reconnect,
            }),
        ));
    }

    /// Parse one inbound text frame. Malformed frames become `parse_error`
    /// events and are not counted.
    pub(crate) fn receive_text(&self, text: &str) -> bool {
        match decode_envelope(text, self.max_frame_bytes) {
            Ok(envelope) => {
                self.receive(envelope);
                true
            }
            Err(err) => {
                self.emit_error(ErrorKind::ParseError, err.to_string());
                false
            }
        }
    }

    pub(crate) fn receive(&self, envelope: Envelope) {
        {
            let mut state = lock(&self.state);
            state.stats.messages_received += 1;
            state.last_event = Some(envelope.clone());
        }
        debug!(event = "frame_received", event_type = %envelope.event_type);
        self.router.dispatch(&RoutedEvent::new(envelope));
    }

    pub(crate) fn stamp(&self, payload: Value) -> Result<String, FrameError> {
        let timestamp = Utc::now().to_rfc3339();
        encode_outbound(
            payload,
            &self.client_id(),
            &timestamp,
            self.max_frame_bytes,
        )
    }
}

#[derive(Default)]
struct Control {
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    attempts: u32,
    generation: u64,
}

struct Shared {
    config: ConnectionConfig,
    core: SourceCore,
    control: Mutex<Control>,
    recovery: Option<Arc<dyn RecoveryProvider>>,
}

/// Live WebSocket event source with heartbeat and capped exponential
/// reconnection. `connect` must be called from inside a tokio runtime.
#[derive(Clone)]
pub struct WsConnection {
    shared: Arc<Shared>,
}

impl WsConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_recovery(config: ConnectionConfig, provider: Arc<dyn RecoveryProvider>) -> Self {
        Self::build(config, Some(provider))
    }

    fn build(config: ConnectionConfig, recovery: Option<Arc<dyn RecoveryProvider>>) -> Self {
        let core = SourceCore::new(config.client_id.clone(), config.max_frame_bytes);
        Self {
            shared: Arc::new(Shared {
                config,
                core,
                control: Mutex::new(Control::default()),
                recovery,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn router(&self) -> &EventRouter {
        self.shared.core.router()
    }
}

impl EventSource for WsConnection {
    fn connect(&self) {
        let mut control = lock(&self.shared.control);
        match self.shared.core.status() {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                debug!(event = "connect_ignored", reason = "already active");
                return;
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
        }
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = control.task.take() {
            task.abort();
        }
        control.attempts = 0;
        control.outbound = None;
        control.generation += 1;
        self.shared.core.set_reconnect_attempts(0);
        self.shared.core.set_status(ConnectionStatus::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        control.shutdown = Some(shutdown_tx);
        let shared = Arc::clone(&self.shared);
        let generation = control.generation;
        control.task = Some(tokio::spawn(run_connection(shared, shutdown_rx, generation)));
        info!(
            event = "connect_requested",
            url = %self.shared.config.url,
            client_id = %self.shared.config.client_id
        );
    }

    fn disconnect(&self) {
        {
            let mut control = lock(&self.shared.control);
            control.attempts = self.shared.config.max_reconnect_attempts;
            control.outbound = None;
            if let Some(shutdown) = control.shutdown.take() {
                let _ = shutdown.send(true);
            }
        }
        self.shared.core.set_status(ConnectionStatus::Disconnected);
        info!(event = "disconnect_requested", client_id = %self.shared.config.client_id);
    }

    fn send_message(&self, payload: Value) -> bool {
        let outbound = lock(&self.shared.control).outbound.clone();
        let outbound = match outbound {
            Some(outbound) if self.shared.core.status() == ConnectionStatus::Connected => outbound,
            _ => {
                self.shared.core.emit_error(
                    ErrorKind::SendError,
                    "send attempted while the connection is not open",
                );
                return false;
            }
        };
        let frame = match self.shared.core.stamp(payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared
                    .core
                    .emit_error(ErrorKind::SendError, err.to_string());
                return false;
            }
        };
        if outbound.send(frame).is_err() {
            self.shared
                .core
                .emit_error(ErrorKind::SendError, "transport writer has stopped");
            return false;
        }
        self.shared.core.record_sent();
        true
    }

    fn subscribe(&self, event_type: &str, handler: Handler) -> Subscription {
        self.shared.core.router().subscribe(event_type, handler)
    }

    fn state(&self) -> ConnectionState {
        self.shared.core.snapshot()
    }
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        lock(&self.control).generation == generation
    }

    fn on_open(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut control = lock(&self.control);
            if control.generation != generation {
                return None;
            }
            control.attempts = 0;
            control.outbound = Some(tx);
        }
        self.core.mark_open();
        info!(
            event = "connection_open",
            url = %self.config.url,
            client_id = %self.config.client_id
        );
        let recovery = self
            .recovery
            .as_ref()
            .and_then(|provider| provider.recovery_data(&self.config.client_id));
        self.core.emit_connected(recovery);
        Some(rx)
    }

    /// Returns the delay before the next attempt, or `None` to stop.
    fn on_close(&self, code: u16, reason: &str, generation: u64) -> Option<Duration> {
        let scheduled = {
            let mut control = lock(&self.control);
            if control.generation != generation {
                return None;
            }
            control.outbound = None;
            let clean = code == CLEAN_CLOSE_CODE;
            if clean || control.attempts >= self.config.max_reconnect_attempts {
                None
            } else {
                let delay = reconnect_delay(self.config.reconnect_base_delay, control.attempts);
                control.attempts += 1;
                Some((delay, control.attempts))
            }
        };

        self.core.set_status(ConnectionStatus::Disconnected);
        match scheduled {
            Some((delay, attempt)) => {
                self.core.set_reconnect_attempts(attempt);
                info!(
                    event = "reconnect_scheduled",
                    code,
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
            }
            None if code != CLEAN_CLOSE_CODE => {
                warn!(
                    event = "reconnect_budget_exhausted",
                    code,
                    max_attempts = self.config.max_reconnect_attempts
                );
            }
            None => {
                info!(event = "connection_closed", code);
            }
        }
        self.core.emit_disconnected(code, reason, scheduled.is_some());
        scheduled.map(|(delay, _)| delay)
    }

    fn finish(&self, generation: u64) {
        let mut control = lock(&self.control);
        if control.generation == generation {
            control.task = None;
            control.outbound = None;
        }
    }
}

async fn run_connection(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>, generation: u64) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !shared.is_current(generation) {
            return;
        }
        shared.core.set_status(ConnectionStatus::Connecting);
        let connected = tokio::select! {
            result = connect_async(shared.config.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        let (code, reason) = match connected {
            Ok((socket, _)) => {
                let Some(outbound) = shared.on_open(generation) else {
                    return;
                };
                drive_socket(&shared, socket, outbound, &mut shutdown).await
            }
            Err(err) => {
                let kind = match err {
                    tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => {
                        ErrorKind::ConnectionFailed
                    }
                    _ => ErrorKind::ConnectionError,
                };
                shared.core.set_status(ConnectionStatus::Error);
                shared
                    .core
                    .emit_error(kind, format!("connect to {} failed: {err}", shared.config.url));
                if kind == ErrorKind::ConnectionFailed {
                    break;
                }
                (ABNORMAL_CLOSE_CODE, "connect failed".to_string())
            }
        };

        let Some(delay) = shared.on_close(code, &reason, generation) else {
            break;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    shared.finish(generation);
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn drive_socket(
    shared: &Shared,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> (u16, String) {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = heartbeat_ticker(shared.config.heartbeat_interval);
    let mut outbound_open = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(close))).await {
                    debug!(event = "close_frame_failed", error = %err);
                }
                return (CLEAN_CLOSE_CODE, "client disconnect".to_string());
            }
            _ = next_tick(&mut heartbeat) => {
                match shared.core.stamp(heartbeat_payload()) {
                    Ok(frame) => {
                        if let Err(err) = sink.send(Message::Text(frame)).await {
                            shared.core.set_status(ConnectionStatus::Error);
                            shared.core.emit_error(ErrorKind::SendError, format!("heartbeat failed: {err}"));
                            return (ABNORMAL_CLOSE_CODE, err.to_string());
                        }
                        shared.core.record_sent();
                    }
                    Err(err) => shared.core.emit_error(ErrorKind::SendError, err.to_string()),
                }
            }
            frame = outbound.recv(), if outbound_open => {
                let Some(frame) = frame else {
                    outbound_open = false;
                    continue;
                };
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    shared.core.set_status(ConnectionStatus::Error);
                    shared.core.emit_error(ErrorKind::SendError, err.to_string());
                    return (ABNORMAL_CLOSE_CODE, err.to_string());
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        shared.core.receive_text(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            shared.core.receive_text(&text);
                        }
                        Err(_) => shared
                            .core
                            .emit_error(ErrorKind::ParseError, "binary frame is not utf-8"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (NO_STATUS_CLOSE_CODE, String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        shared.core.set_status(ConnectionStatus::Error);
                        shared.core.emit_error(ErrorKind::ConnectionError, err.to_string());
                        return (ABNORMAL_CLOSE_CODE, err.to_string());
                    }
                    None => return (ABNORMAL_CLOSE_CODE, "stream ended".to_string()),
                }
            }
        }
    }
}

fn heartbeat_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(250);
        assert_eq!(reconnect_delay(base, 0), Duration::from_millis(250));
        assert_eq!(reconnect_delay(base, 1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(base, 3), Duration::from_secs(2));
        assert_eq!(reconnect_delay(base, 40), reconnect_delay(base, 16));
    }

    #[test]
    fn config_rejects_non_websocket_urls() {
        assert!(ConnectionConfig::new("ws://127.0.0.1:8000/ws", "c-1").is_ok());
        assert!(matches!(
            ConnectionConfig::new("http://127.0.0.1:8000/ws", "c-1"),
            Err(ConnectionError::UnsupportedScheme(scheme)) if scheme == "http"
        ));
        assert!(matches!(
            ConnectionConfig::new("not a url", "c-1"),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[test]
    fn send_before_connect_reports_send_error() {
        let config = ConnectionConfig::new("ws://127.0.0.1:9/ws", "c-1").expect("config");
        let connection = WsConnection::new(config);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        connection.router().subscribe_fn(event_types::ERROR, move |event| {
            if event.envelope.data["error_type"] == "send_error" {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        assert!(!connection.send_message(json!({"type": "get_processing_status"})));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let state = connection.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.stats.messages_sent, 0);
        assert!(!connection.is_connected());
    }

    #[test]
    fn malformed_frames_do_not_count_as_received() {
        let core = SourceCore::new("c-1".to_string(), DEFAULT_MAX_FRAME_BYTES);
        let parse_errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&parse_errors);
        core.router().subscribe_fn(event_types::ERROR, move |event| {
            if event.envelope.data["error_type"] == "parse_error" {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        assert!(!core.receive_text("{not json"));
        assert!(!core.receive_text(r#"{"data": {}}"#));
        assert!(core.receive_text(r#"{"type": "heartbeat", "data": {}}"#));

        let state = core.snapshot();
        assert_eq!(parse_errors.load(Ordering::SeqCst), 2);
        assert_eq!(state.stats.messages_received, 1);
        assert_eq!(
            state.last_event.map(|event| event.event_type),
            Some("heartbeat".to_string())
        );
    }
}
