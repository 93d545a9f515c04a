//! Per-widget telemetry socket with a fixed-interval reconnect.
//!
//! The reconnect policy is flat: one attempt every
//! `reconnect_interval` (3 s by default), forever, without jitter or backoff.
//! Failures are logged and retried; there is no terminal error state.

use crate::error::SyncError;
use futures_util::{SinkExt, StreamExt};
use glass_core::wire::{
    decode_message, encode_message, CommandPayload, TelemetryMessage, DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080";
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Falls back to [`DEFAULT_SERVER_URL`] when unset or blank.
    pub server_url: Option<String>,
    pub auto_connect: bool,
    /// Status indicator owned by the widget; used to label its log lines.
    pub status_element_id: Option<String>,
    pub reconnect_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            auto_connect: true,
            status_element_id: None,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    pub fn resolve_url(&self) -> Result<Url, SyncError> {
        let raw = self
            .server_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_SERVER_URL);
        let url = Url::parse(raw)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(SyncError::InvalidConfig(format!(
                "widget socket needs ws:// or wss://, got {other}://"
            ))),
        }
    }

    fn validate(&self) -> Result<Url, SyncError> {
        if self.reconnect_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "reconnect_interval must be positive".to_string(),
            ));
        }
        self.resolve_url()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// Lifecycle hooks a widget overrides.
pub trait WidgetHandler: Send + 'static {
    fn on_connect(&mut self) {}

    fn on_message(&mut self, message: TelemetryMessage);

    fn on_disconnect(&mut self) {}
}

pub struct WidgetConnection {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    label: String,
    reconnect_interval: Duration,
    handler: Mutex<Option<Box<dyn WidgetHandler>>>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    reconnect_armed: AtomicBool,
    attempts: AtomicU64,
}

impl WidgetConnection {
    /// Builds the connection and, with `auto_connect`, starts it. Must be
    /// called inside a tokio runtime when `auto_connect` is set.
    pub fn new<H: WidgetHandler>(config: ConnectionConfig, handler: H) -> Result<Self, SyncError> {
        let url = config.validate()?;
        let label = config
            .status_element_id
            .clone()
            .unwrap_or_else(|| url.to_string());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(Inner {
                url,
                label,
                reconnect_interval: config.reconnect_interval,
                handler: Mutex::new(Some(Box::new(handler))),
                state,
                outbound: Mutex::new(None),
                shutdown,
                task: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                reconnect_armed: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
        };
        if config.auto_connect {
            connection.connect();
        }
        Ok(connection)
    }

    pub fn connect(&self) {
        if self.inner.is_destroyed() {
            return;
        }
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(run(self.inner.clone())));
    }

    /// Sends when connected; otherwise the message is dropped and `false`
    /// is returned.
    pub fn send(&self, message: &TelemetryMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(event = "widget_send_dropped", widget = %self.inner.label);
            return false;
        }
        let text = match encode_message(message, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "widget_encode_error", widget = %self.inner.label, error = %err);
                return false;
            }
        };
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    pub fn send_command(&self, command: &str, value: Value) -> bool {
        self.send(&TelemetryMessage::Command(CommandPayload {
            command: command.to_string(),
            value,
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn status_label(&self) -> &'static str {
        self.state().label()
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.reconnect_armed.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Detaches the handler, closes the socket and cancels any pending
    /// reconnect. Repeated calls are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.shutdown.send_replace(true);
        self.inner.reconnect_armed.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Disconnected);
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(event = "widget_destroyed", widget = %self.inner.label);
    }
}

impl Drop for WidgetConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        if self.is_destroyed() {
            return;
        }
        self.state.send_replace(state);
    }

    fn with_handler(&self, f: impl FnOnce(&mut dyn WidgetHandler)) {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handler.as_mut() {
            f(handler.as_mut());
        }
    }

    fn dispatch(&self, raw: &[u8]) {
        match decode_message::<TelemetryMessage>(raw, DEFAULT_MAX_FRAME_BYTES) {
            Ok(message) => self.with_handler(|handler| handler.on_message(message)),
            Err(err) => {
                debug!(event = "widget_message_dropped", widget = %self.label, error = %err);
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if inner.is_destroyed() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        inner.attempts.fetch_add(1, Ordering::SeqCst);

        let connect = tokio::select! {
            result = connect_async(inner.url.as_str()) => result,
            _ = wait_shutdown(&mut shutdown) => break,
        };

        match connect {
            Ok((ws, _)) => {
                if inner.is_destroyed() {
                    let mut ws = ws;
                    let _ = ws.close(None).await;
                    break;
                }
                inner.reconnect_armed.store(false, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
                inner.set_state(ConnectionState::Connected);
                info!(event = "widget_connected", widget = %inner.label, url = %inner.url);
                inner.with_handler(|handler| handler.on_connect());

                pump(&inner, ws, rx, &mut shutdown).await;

                inner
                    .outbound
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if inner.is_destroyed() {
                    break;
                }
                inner.set_state(ConnectionState::Disconnected);
                info!(event = "widget_disconnected", widget = %inner.label);
                inner.with_handler(|handler| handler.on_disconnect());
            }
            Err(err) => {
                warn!(event = "widget_connect_error", widget = %inner.label, error = %err);
                inner.set_state(ConnectionState::Disconnected);
                inner.with_handler(|handler| handler.on_disconnect());
            }
        }

        if inner.is_destroyed() {
            break;
        }
        inner.reconnect_armed.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(inner.reconnect_interval) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }
    inner.reconnect_armed.store(false, Ordering::SeqCst);
}

async fn pump(
    inner: &Inner,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => inner.dispatch(&bytes),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "widget_read_error", widget = %inner.label, error = %err);
                    break;
                }
            },
            Some(message) = outbound.recv() => {
                if let Err(err) = sink.send(message).await {
                    warn!(event = "widget_write_error", widget = %inner.label, error = %err);
                    break;
                }
            }
            _ = wait_shutdown(shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
