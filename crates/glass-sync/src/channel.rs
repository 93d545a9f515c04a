//! Same-device pub/sub between tabs.
//!
//! A [`SafeChannel`] prefers the native [`BroadcastRegistry`] and falls back to
//! signalling through [`StorageHandle`] mutations: the payload is written under
//! a channel key and removed straight away, and other tabs pick it up from the
//! storage event stream. Storage events never reach the writing tab, so a tab
//! never hears its own posts on the fallback path.

use crate::storage::StorageHandle;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;
pub const STORAGE_KEY_PREFIX: &str = "SimGlass_channel_";

#[derive(Debug, Clone)]
struct ChannelFrame {
    sender: u64,
    data: Value,
}

/// Native broadcast primitive: one per storage profile, shared by its tabs.
#[derive(Clone, Default)]
pub struct BroadcastRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    channels: Mutex<HashMap<String, broadcast::Sender<ChannelFrame>>>,
    next_id: AtomicU64,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&self, name: &str) -> (broadcast::Sender<ChannelFrame>, u64) {
        let mut channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        (sender, id)
    }
}

/// Which transport a tab can use for channels.
#[derive(Clone)]
pub enum ChannelBackend {
    Native(BroadcastRegistry),
    Storage(StorageHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub data: Value,
}

type MessageHandler = Arc<Mutex<dyn FnMut(ChannelEvent) + Send>>;

enum Transport {
    Native {
        sender: broadcast::Sender<ChannelFrame>,
        id: u64,
    },
    Storage {
        storage: StorageHandle,
        key: String,
    },
}

struct ChannelInner {
    name: String,
    closed: AtomicBool,
    handler: Mutex<Option<MessageHandler>>,
    transport: Transport,
}

impl ChannelInner {
    /// Runs the handler with the slot unlocked, so the callback may call
    /// `close()` or `set_onmessage()` on its own channel.
    fn deliver(&self, data: Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(handler) = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        let mut callback = handler.lock().unwrap_or_else(PoisonError::into_inner);
        // close() may have landed while we waited for the lock.
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        (&mut *callback)(ChannelEvent { data });
    }
}

pub struct SafeChannel {
    inner: Arc<ChannelInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SafeChannel {
    /// Opens `name` on `backend`. Must be called inside a tokio runtime.
    pub fn open(name: &str, backend: &ChannelBackend) -> Self {
        let transport = match backend {
            ChannelBackend::Native(registry) => {
                let (sender, id) = registry.join(name);
                Transport::Native { sender, id }
            }
            ChannelBackend::Storage(storage) => Transport::Storage {
                storage: storage.clone(),
                key: format!("{STORAGE_KEY_PREFIX}{name}"),
            },
        };
        let inner = Arc::new(ChannelInner {
            name: name.to_string(),
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
            transport,
        });
        let listener = spawn_listener(inner.clone());
        debug!(event = "channel_open", channel = name, native = inner.is_native());
        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_native(&self) -> bool {
        self.inner.is_native()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn set_onmessage<F>(&self, callback: F)
    where
        F: FnMut(ChannelEvent) + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let handler: MessageHandler = Arc::new(Mutex::new(callback));
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn post_message(&self, data: Value) {
        if self.is_closed() {
            debug!(event = "channel_post_after_close", channel = %self.inner.name);
            return;
        }
        match &self.inner.transport {
            Transport::Native { sender, id } => {
                // No receivers simply means no other tab is listening.
                let _ = sender.send(ChannelFrame { sender: *id, data });
            }
            Transport::Storage { storage, key } => {
                let raw = data.to_string();
                if let Err(err) = storage.set(key, raw) {
                    warn!(event = "channel_post_error", channel = %self.inner.name, error = %err);
                    return;
                }
                if let Err(err) = storage.remove(key) {
                    warn!(event = "channel_post_error", channel = %self.inner.name, error = %err);
                }
            }
        }
    }

    pub fn post<T: Serialize>(&self, message: &T) {
        match serde_json::to_value(message) {
            Ok(value) => self.post_message(value),
            Err(err) => {
                warn!(event = "channel_encode_error", channel = %self.inner.name, error = %err)
            }
        }
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        debug!(event = "channel_close", channel = %self.inner.name);
    }
}

impl Drop for SafeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelInner {
    fn is_native(&self) -> bool {
        matches!(self.transport, Transport::Native { .. })
    }
}

fn spawn_listener(inner: Arc<ChannelInner>) -> JoinHandle<()> {
    match &inner.transport {
        Transport::Native { sender, id } => {
            let mut rx = sender.subscribe();
            let own_id = *id;
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            if frame.sender != own_id {
                                inner.deliver(frame.data);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(event = "channel_lagged", channel = %inner.name, skipped = skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        }
        Transport::Storage { storage, key } => {
            let mut events = storage.subscribe();
            let key = key.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if event.key != key {
                        continue;
                    }
                    let Some(raw) = event.new_value else {
                        continue;
                    };
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(data) => inner.deliver(data),
                        Err(err) => {
                            debug!(event = "channel_parse_error", channel = %inner.name, error = %err)
                        }
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SharedStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collect(channel: &SafeChannel) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.set_onmessage(move |event| {
            let _ = tx.send(event.data);
        });
        rx
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Value>, expected: usize) -> Vec<Value> {
        let mut out = Vec::new();
        while out.len() < expected {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(value)) => out.push(value),
                _ => break,
            }
        }
        out
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Value>) {
        let got = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(got.is_err(), "unexpected message: {got:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn native_delivers_in_order_and_skips_sender() {
        let registry = BroadcastRegistry::new();
        let backend = ChannelBackend::Native(registry);
        let sender = SafeChannel::open("cockpit-sync", &backend);
        let receiver = SafeChannel::open("cockpit-sync", &backend);
        let mut own = collect(&sender);
        let mut other = collect(&receiver);

        for seq in 0..20 {
            sender.post_message(json!({"seq": seq}));
        }

        let received = drain(&mut other, 20).await;
        let seqs: Vec<i64> = received
            .iter()
            .filter_map(|value| value["seq"].as_i64())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        assert_silent(&mut own).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn native_channels_are_isolated_by_name() {
        let backend = ChannelBackend::Native(BroadcastRegistry::new());
        let fuel = SafeChannel::open("fuel", &backend);
        let radio = SafeChannel::open("radio", &backend);
        let fuel_peer = SafeChannel::open("fuel", &backend);
        let mut radio_rx = collect(&radio);
        let mut fuel_rx = collect(&fuel_peer);

        fuel.post_message(json!({"left": 41.5}));

        assert_eq!(drain(&mut fuel_rx, 1).await, vec![json!({"left": 41.5})]);
        assert_silent(&mut radio_rx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn storage_fallback_reaches_other_tabs_in_order() {
        let storage = SharedStorage::in_memory();
        let tab_a = ChannelBackend::Storage(storage.tab());
        let tab_b = ChannelBackend::Storage(storage.tab());
        let sender = SafeChannel::open("cockpit-sync", &tab_a);
        let receiver = SafeChannel::open("cockpit-sync", &tab_b);
        assert!(!sender.is_native());
        let mut other = collect(&receiver);

        for seq in 0..10 {
            sender.post_message(json!({"seq": seq}));
        }

        let received = drain(&mut other, 10).await;
        assert_eq!(
            received,
            (0..10).map(|seq| json!({"seq": seq})).collect::<Vec<_>>()
        );
        let key = format!("{STORAGE_KEY_PREFIX}cockpit-sync");
        assert_eq!(storage.tab().get(&key), None, "payload key must be removed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn storage_fallback_never_echoes_within_the_writing_tab() {
        let storage = SharedStorage::in_memory();
        let tab = ChannelBackend::Storage(storage.tab());
        let sender = SafeChannel::open("cockpit-sync", &tab);
        let same_tab_peer = SafeChannel::open("cockpit-sync", &tab);
        let mut own = collect(&sender);
        let mut peer = collect(&same_tab_peer);

        sender.post_message(json!({"hello": true}));

        assert_silent(&mut own).await;
        assert_silent(&mut peer).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_stops_delivery() {
        let backend = ChannelBackend::Native(BroadcastRegistry::new());
        let sender = SafeChannel::open("cockpit-sync", &backend);
        let receiver = SafeChannel::open("cockpit-sync", &backend);
        let mut rx = collect(&receiver);

        sender.post_message(json!(1));
        assert_eq!(drain(&mut rx, 1).await, vec![json!(1)]);

        receiver.close();
        receiver.close();
        assert!(receiver.is_closed());
        sender.post_message(json!(2));
        // Sender dropped with the handler: the stream ends with nothing new.
        let after = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(matches!(after, Ok(None) | Err(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_can_close_its_own_channel() {
        let backend = ChannelBackend::Native(BroadcastRegistry::new());
        let sender = SafeChannel::open("cockpit-sync", &backend);
        let receiver = Arc::new(SafeChannel::open("cockpit-sync", &backend));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let own = receiver.clone();
        receiver.set_onmessage(move |event| {
            own.close();
            let _ = tx.send(event.data);
        });

        sender.post_message(json!(1));
        assert_eq!(drain(&mut rx, 1).await, vec![json!(1)]);
        assert!(receiver.is_closed());

        sender.post_message(json!(2));
        let after = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(matches!(after, Ok(None) | Err(_)));

        // The runtime is still serving other channels.
        let peer = SafeChannel::open("cockpit-sync", &backend);
        let mut peer_rx = collect(&peer);
        sender.post_message(json!(3));
        assert_eq!(drain(&mut peer_rx, 1).await, vec![json!(3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_can_replace_itself() {
        let backend = ChannelBackend::Native(BroadcastRegistry::new());
        let sender = SafeChannel::open("cockpit-sync", &backend);
        let receiver = Arc::new(SafeChannel::open("cockpit-sync", &backend));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let own = receiver.clone();
        receiver.set_onmessage(move |_| {
            let tx = tx.clone();
            own.set_onmessage(move |event| {
                let _ = tx.send(event.data);
            });
        });

        sender.post_message(json!("first"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.post_message(json!("second"));
        assert_eq!(drain(&mut rx, 1).await, vec![json!("second")]);
        receiver.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_in_storage_key_is_ignored() {
        let storage = SharedStorage::in_memory();
        let writer = storage.tab();
        let receiver = SafeChannel::open("cockpit-sync", &ChannelBackend::Storage(storage.tab()));
        let mut rx = collect(&receiver);

        let key = format!("{STORAGE_KEY_PREFIX}cockpit-sync");
        writer.set(&key, "{not json").expect("set");
        writer.set(&key, "{\"ok\":1}").expect("set");

        assert_eq!(drain(&mut rx, 1).await, vec![json!({"ok": 1})]);
    }
}
