//! Shared-cockpit room client.
//!
//! One persistent socket to the room relay. A dropped socket is retried with
//! exponential backoff (`min(base * 2^attempt, max)`) up to
//! `max_attempts`, after which a single terminal error is emitted and the
//! client stays down until `connect` is called again. A successful reconnect
//! re-issues `join-room` for the last known room.

use crate::error::SyncError;
use futures_util::{SinkExt, StreamExt};
use glass_core::wire::{
    decode_message, encode_message, ActionPayload, ChatPayload, CreateRoomPayload,
    JoinRoomPayload, PilotChangePayload, RoomCreatedPayload, RoomEvent, RoomJoinedPayload,
    RoomRequest, WidgetStatePayload, DEFAULT_MAX_FRAME_BYTES,
};
use glass_core::{normalize_room_code, CrewRole, Pilot};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_ROOM_SERVER: &str = "ws://localhost:8085";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnect attempt `attempt` (counted from 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RoomSyncConfig {
    pub server_url: String,
    /// Widget that owns this client; inbound state and actions for other
    /// widgets are ignored.
    pub widget_id: String,
    pub reconnect: ReconnectPolicy,
}

impl RoomSyncConfig {
    pub fn new(widget_id: impl Into<String>) -> Self {
        Self {
            server_url: DEFAULT_ROOM_SERVER.to_string(),
            widget_id: widget_id.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn validate(&self) -> Result<Url, SyncError> {
        if self.widget_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("widget_id is required".to_string()));
        }
        let url = Url::parse(self.server_url.trim())?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(SyncError::InvalidConfig(format!(
                "room relay needs ws:// or wss://, got {other}://"
            ))),
        }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    connect: Vec<Listener<()>>,
    room_created: Vec<Listener<RoomCreatedPayload>>,
    room_joined: Vec<Listener<RoomJoinedPayload>>,
    pilot_joined: Vec<Listener<PilotChangePayload>>,
    pilot_left: Vec<Listener<PilotChangePayload>>,
    state_update: Vec<Listener<WidgetStatePayload>>,
    action: Vec<Listener<ActionPayload>>,
    chat: Vec<Listener<ChatPayload>>,
    error: Vec<Listener<String>>,
}

#[derive(Debug, Default)]
struct RoomCache {
    room_code: Option<String>,
    pilot_name: Option<String>,
    role: Option<CrewRole>,
    pilots: Vec<Pilot>,
}

struct Inner {
    url: Url,
    config: RoomSyncConfig,
    listeners: Mutex<Listeners>,
    room: Mutex<RoomCache>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    attempts: AtomicU32,
    reconnecting: AtomicBool,
    gave_up: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

pub struct RoomSyncClient {
    inner: Arc<Inner>,
}

impl RoomSyncClient {
    pub fn new(config: RoomSyncConfig) -> Result<Self, SyncError> {
        let url = config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                listeners: Mutex::new(Listeners::default()),
                room: Mutex::new(RoomCache::default()),
                outbound: Mutex::new(None),
                attempts: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
                gave_up: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.inner.listeners().connect.push(Arc::new(move |_: &()| f()));
        self
    }

    pub fn on_room_created(
        &self,
        f: impl Fn(&RoomCreatedPayload) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.listeners().room_created.push(Arc::new(f));
        self
    }

    pub fn on_room_joined(&self, f: impl Fn(&RoomJoinedPayload) + Send + Sync + 'static) -> &Self {
        self.inner.listeners().room_joined.push(Arc::new(f));
        self
    }

    pub fn on_pilot_joined(
        &self,
        f: impl Fn(&PilotChangePayload) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.listeners().pilot_joined.push(Arc::new(f));
        self
    }

    pub fn on_pilot_left(&self, f: impl Fn(&PilotChangePayload) + Send + Sync + 'static) -> &Self {
        self.inner.listeners().pilot_left.push(Arc::new(f));
        self
    }

    pub fn on_state_update(
        &self,
        f: impl Fn(&WidgetStatePayload) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.listeners().state_update.push(Arc::new(f));
        self
    }

    pub fn on_action(&self, f: impl Fn(&ActionPayload) + Send + Sync + 'static) -> &Self {
        self.inner.listeners().action.push(Arc::new(f));
        self
    }

    pub fn on_chat(&self, f: impl Fn(&ChatPayload) + Send + Sync + 'static) -> &Self {
        self.inner.listeners().chat.push(Arc::new(f));
        self
    }

    pub fn on_error(&self, f: impl Fn(&String) + Send + Sync + 'static) -> &Self {
        self.inner.listeners().error.push(Arc::new(f));
        self
    }

    /// Opens the socket. On failure the error is returned and a reconnect is
    /// still scheduled, as for any other close.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.gave_up.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.shutdown.send_replace(false);
        match open(&self.inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(event = "room_connect_error", url = %self.inner.url, error = %err);
                schedule_reconnect(self.inner.clone());
                Err(err)
            }
        }
    }

    /// Closes the socket and stops any reconnect in progress.
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn create_room(&self, pilot_name: &str) -> bool {
        self.inner.room().pilot_name = Some(pilot_name.to_string());
        self.send(&RoomRequest::CreateRoom(CreateRoomPayload {
            pilot_name: pilot_name.to_string(),
        }))
    }

    pub fn join_room(&self, room_code: &str, pilot_name: &str) -> bool {
        let room_code = normalize_room_code(room_code);
        {
            let mut room = self.inner.room();
            room.room_code = Some(room_code.clone());
            room.pilot_name = Some(pilot_name.to_string());
        }
        self.send(&RoomRequest::JoinRoom(JoinRoomPayload {
            room_code,
            pilot_name: pilot_name.to_string(),
        }))
    }

    pub fn leave_room(&self) -> bool {
        let sent = self.send(&RoomRequest::LeaveRoom);
        *self.inner.room() = RoomCache::default();
        sent
    }

    pub fn sync_state(&self, state: Value) -> bool {
        self.send(&RoomRequest::StateUpdate(WidgetStatePayload {
            widget: self.inner.config.widget_id.clone(),
            state,
            from: None,
        }))
    }

    pub fn sync_action(&self, action: &str, data: Value) -> bool {
        self.send(&RoomRequest::Action(ActionPayload {
            widget: self.inner.config.widget_id.clone(),
            action: action.to_string(),
            data,
            from: None,
        }))
    }

    pub fn send_chat(&self, message: &str) -> bool {
        self.send(&RoomRequest::Chat(ChatPayload {
            message: message.to_string(),
            from: None,
            timestamp: None,
        }))
    }

    pub fn room_code(&self) -> Option<String> {
        self.inner.room().room_code.clone()
    }

    pub fn pilot_name(&self) -> Option<String> {
        self.inner.room().pilot_name.clone()
    }

    pub fn role(&self) -> Option<CrewRole> {
        self.inner.room().role
    }

    pub fn is_captain(&self) -> bool {
        self.role() == Some(CrewRole::Captain)
    }

    pub fn pilots(&self) -> Vec<Pilot> {
        self.inner.room().pilots.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_open()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn widget_id(&self) -> &str {
        &self.inner.config.widget_id
    }

    fn send(&self, request: &RoomRequest) -> bool {
        self.inner.send(request)
    }
}

impl Drop for RoomSyncClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn room(&self) -> MutexGuard<'_, RoomCache> {
        self.room.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn send(&self, request: &RoomRequest) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            debug!(event = "room_send_dropped", widget = %self.config.widget_id);
            return false;
        };
        match encode_message(request, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => tx.send(Message::Text(text)).is_ok(),
            Err(err) => {
                warn!(event = "room_encode_error", widget = %self.config.widget_id, error = %err);
                false
            }
        }
    }

    /// Runs every listener; one panicking listener does not stop the rest.
    fn emit<T>(&self, pick: impl Fn(&Listeners) -> &Vec<Listener<T>>, payload: &T) {
        let snapshot: Vec<Listener<T>> = pick(&*self.listeners()).clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                error!(event = "room_listener_panic", widget = %self.config.widget_id);
            }
        }
    }

    fn emit_error(&self, message: String) {
        warn!(event = "room_error", widget = %self.config.widget_id, error = %message);
        self.emit(|l| &l.error, &message);
    }

    fn dispatch(&self, raw: &[u8]) {
        let event = match decode_message::<RoomEvent>(raw, DEFAULT_MAX_FRAME_BYTES) {
            Ok(event) => event,
            Err(err) => {
                debug!(event = "room_message_dropped", error = %err);
                return;
            }
        };
        match event {
            RoomEvent::RoomCreated(payload) => {
                {
                    let mut room = self.room();
                    room.room_code = Some(payload.room_code.clone());
                    room.pilot_name = Some(payload.pilot_name.clone());
                    room.role = Some(payload.role);
                    room.pilots = vec![Pilot {
                        pilot_name: payload.pilot_name.clone(),
                        role: payload.role,
                    }];
                }
                info!(event = "room_created", room_code = %payload.room_code);
                self.emit(|l| &l.room_created, &payload);
            }
            RoomEvent::RoomJoined(payload) => {
                {
                    let mut room = self.room();
                    room.room_code = Some(payload.room_code.clone());
                    room.pilot_name = Some(payload.pilot_name.clone());
                    room.role = Some(payload.role);
                    room.pilots = payload.pilots.clone();
                }
                info!(event = "room_joined", room_code = %payload.room_code, role = %payload.role);
                self.emit(|l| &l.room_joined, &payload);
            }
            RoomEvent::PilotJoined(payload) => {
                self.room().pilots = payload.pilots.clone();
                self.emit(|l| &l.pilot_joined, &payload);
            }
            RoomEvent::PilotLeft(payload) => {
                self.room().pilots = payload.pilots.clone();
                self.emit(|l| &l.pilot_left, &payload);
            }
            RoomEvent::StateUpdate(payload) => {
                if payload.widget == self.config.widget_id {
                    self.emit(|l| &l.state_update, &payload);
                }
            }
            RoomEvent::Action(payload) => {
                if payload.widget == self.config.widget_id {
                    self.emit(|l| &l.action, &payload);
                }
            }
            RoomEvent::Chat(payload) => self.emit(|l| &l.chat, &payload),
            RoomEvent::Error(payload) => self.emit_error(payload.message),
        }
    }

    fn rejoin(&self) {
        let (room_code, pilot_name) = {
            let room = self.room();
            (room.room_code.clone(), room.pilot_name.clone())
        };
        if let (Some(room_code), Some(pilot_name)) = (room_code, pilot_name) {
            debug!(event = "room_rejoin", room_code = %room_code);
            self.send(&RoomRequest::JoinRoom(JoinRoomPayload {
                room_code,
                pilot_name,
            }));
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

async fn open(inner: &Arc<Inner>) -> Result<(), SyncError> {
    let (ws, _) = connect_async(inner.url.as_str())
        .await
        .map_err(|err| SyncError::Connect(err.to_string()))?;
    inner.attempts.store(0, Ordering::SeqCst);
    let (tx, rx) = mpsc::unbounded_channel();
    *inner.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    info!(event = "room_connected", url = %inner.url, widget = %inner.config.widget_id);
    tokio::spawn(session(inner.clone(), ws, rx));
    inner.emit(|l| &l.connect, &());
    Ok(())
}

async fn session(
    inner: Arc<Inner>,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => inner.dispatch(&bytes),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(event = "room_read_error", error = %err);
                    break;
                }
            },
            Some(message) = outbound.recv() => {
                if let Err(err) = sink.send(message).await {
                    warn!(event = "room_write_error", error = %err);
                    break;
                }
            }
            _ = wait_shutdown(&mut shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    inner
        .outbound
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    info!(event = "room_disconnected", widget = %inner.config.widget_id);
    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: Arc<Inner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(reconnect_loop(inner));
}

async fn reconnect_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let policy = inner.config.reconnect;
    loop {
        if inner.attempts.load(Ordering::SeqCst) >= policy.max_attempts {
            inner.reconnecting.store(false, Ordering::SeqCst);
            if !inner.gave_up.swap(true, Ordering::SeqCst) {
                inner.emit_error(format!(
                    "Connection lost after {} reconnect attempts",
                    policy.max_attempts
                ));
            }
            return;
        }
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = policy.delay_for(attempt);
        info!(
            event = "room_reconnect_scheduled",
            attempt = attempt,
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown) => {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        // A session opened below may close at once and start its own chain.
        inner.reconnecting.store(false, Ordering::SeqCst);
        match open(&inner).await {
            Ok(()) => {
                inner.rejoin();
                return;
            }
            Err(err) => {
                warn!(event = "room_reconnect_failed", attempt = attempt, error = %err);
                if inner.reconnecting.swap(true, Ordering::SeqCst) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dead_url, wait_until, TestServer};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_config(url: String) -> RoomSyncConfig {
        RoomSyncConfig {
            server_url: url,
            widget_id: "autopilot".to_string(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 5,
            },
        }
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |value: &T| {
            sink.lock().expect("lock").push(value.clone());
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn config_validation() {
        assert!(RoomSyncClient::new(RoomSyncConfig::new("")).is_err());
        let http = RoomSyncConfig {
            server_url: "http://localhost:8085".to_string(),
            ..RoomSyncConfig::new("fuel")
        };
        assert!(matches!(
            RoomSyncClient::new(http),
            Err(SyncError::InvalidConfig(_))
        ));
        assert_eq!(RoomSyncConfig::new("fuel").server_url, "ws://localhost:8085");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_room_populates_code_and_notifies_listener() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        let (created, listener) = recorder::<RoomCreatedPayload>();
        client.on_room_created(listener);

        client.connect().await.expect("connect");
        let mut peer = server.next_peer().await;
        assert!(client.create_room("Alice"));
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "create-room", "pilotName": "Alice"})
        );

        peer.send_json(&json!({
            "type": "room-created",
            "roomCode": "ABC123",
            "pilotName": "Alice",
            "role": "captain"
        }))
        .await;

        wait_until(|| client.room_code().as_deref() == Some("ABC123"), "room code").await;
        assert!(client.is_captain());
        let created = created.lock().expect("lock").clone();
        assert_eq!(
            created,
            vec![RoomCreatedPayload {
                room_code: "ABC123".to_string(),
                pilot_name: "Alice".to_string(),
                role: CrewRole::Captain,
            }]
        );
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_room_uppercases_the_code() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        client.connect().await.expect("connect");
        let mut peer = server.next_peer().await;

        assert!(client.join_room("abc123", "Bob"));
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "join-room", "roomCode": "ABC123", "pilotName": "Bob"})
        );
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_and_actions_are_filtered_by_widget() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        let (states, state_listener) = recorder::<WidgetStatePayload>();
        let (actions, action_listener) = recorder::<ActionPayload>();
        client
            .on_state_update(state_listener)
            .on_action(action_listener);
        client.connect().await.expect("connect");
        let mut peer = server.next_peer().await;

        peer.send_json(&json!({"type": "state-update", "widget": "fuel", "state": {"left": 1}}))
            .await;
        peer.send_json(&json!({"type": "action", "widget": "fuel", "action": "crossfeed"}))
            .await;
        peer.send_json(&json!({"type": "state-update", "widget": "autopilot", "state": {"hdg": 90}, "from": "Bob"}))
            .await;
        peer.send_json(&json!({"type": "action", "widget": "autopilot", "action": "engage", "data": {"mode": "HDG"}}))
            .await;

        wait_until(|| actions.lock().expect("lock").len() == 1, "autopilot action").await;
        let states = states.lock().expect("lock").clone();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, json!({"hdg": 90}));
        assert_eq!(states[0].from.as_deref(), Some("Bob"));
        assert_eq!(actions.lock().expect("lock")[0].action, "engage");
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_listener_does_not_starve_the_others() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        let (chats, chat_listener) = recorder::<ChatPayload>();
        client
            .on_chat(|_| panic!("listener bug"))
            .on_chat(chat_listener);
        client.connect().await.expect("connect");
        let mut peer = server.next_peer().await;

        peer.send_json(&json!({"type": "chat", "from": "Alice", "message": "V1", "timestamp": 1}))
            .await;
        peer.send_json(&json!({"type": "chat", "from": "Alice", "message": "rotate", "timestamp": 2}))
            .await;

        wait_until(|| chats.lock().expect("lock").len() == 2, "both chats").await;
        assert!(client.is_connected());
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roster_follows_pilot_join_and_leave() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        client.connect().await.expect("connect");
        let mut peer = server.next_peer().await;

        peer.send_json(&json!({
            "type": "pilot-joined",
            "pilotName": "Bob",
            "role": "first-officer",
            "pilots": [
                {"pilotName": "Alice", "role": "captain"},
                {"pilotName": "Bob", "role": "first-officer"}
            ]
        }))
        .await;
        wait_until(|| client.pilots().len() == 2, "two pilots").await;

        peer.send_json(&json!({
            "type": "pilot-left",
            "pilotName": "Bob",
            "pilots": [{"pilotName": "Alice", "role": "captain"}]
        }))
        .await;
        wait_until(|| client.pilots().len() == 1, "one pilot").await;
        assert_eq!(client.pilots()[0].pilot_name, "Alice");
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gives_up_after_max_attempts_with_one_terminal_error() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        client.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.connect().await.expect("connect");
        let peer = server.next_peer().await;

        server.stop_listening().await;
        peer.close().await;

        wait_until(|| errors.load(Ordering::SeqCst) == 1, "terminal error").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(client.reconnect_attempts(), 5);
        assert!(!client.is_connected());
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_initial_connect_rejects_and_still_retries() {
        let client = RoomSyncClient::new(fast_config(dead_url())).expect("client");
        let (errors, listener) = recorder::<String>();
        client.on_error(listener);

        assert!(matches!(client.connect().await, Err(SyncError::Connect(_))));
        wait_until(|| errors.lock().expect("lock").len() == 1, "terminal error").await;
        assert_eq!(client.reconnect_attempts(), 5);
        assert!(errors.lock().expect("lock")[0].contains("5 reconnect attempts"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_rejoins_last_room() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        client.on_connect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.connect().await.expect("connect");
        let mut first = server.next_peer().await;

        client.join_room("abc123", "Bob");
        first.recv_json().await;
        first
            .send_json(&json!({
                "type": "room-joined",
                "roomCode": "ABC123",
                "pilotName": "Bob",
                "role": "first-officer",
                "pilots": [
                    {"pilotName": "Alice", "role": "captain"},
                    {"pilotName": "Bob", "role": "first-officer"}
                ],
                "state": {"autopilot": {"hdg": 90}}
            }))
            .await;
        wait_until(|| client.role() == Some(CrewRole::FirstOfficer), "joined").await;
        first.close().await;

        let mut second = server.next_peer().await;
        assert_eq!(
            second.recv_json().await,
            json!({"type": "join-room", "roomCode": "ABC123", "pilotName": "Bob"})
        );
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(client.reconnect_attempts(), 0);
        client.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_are_dropped_while_disconnected() {
        let client = RoomSyncClient::new(fast_config(dead_url())).expect("client");
        assert!(!client.sync_state(json!({"hdg": 90})));
        assert!(!client.sync_action("engage", json!(null)));
        assert!(!client.send_chat("anyone there?"));
        assert!(!client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_stops_reconnecting() {
        let mut server = TestServer::start().await;
        let client = RoomSyncClient::new(fast_config(server.url())).expect("client");
        client.connect().await.expect("connect");
        let peer = server.next_peer().await;

        client.disconnect();
        peer.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.accepted(), 1);
        assert_eq!(client.reconnect_attempts(), 0);
    }
}
