use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A mutation observed by every tab except the one that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
    origin: u64,
}

/// Profile-wide key/value store shared by all tabs, optionally backed by a
/// JSON file. Writes are last-writer-wins with no locking across tabs.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    entries: RwLock<BTreeMap<String, String>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
    next_origin: AtomicU64,
    /// Serialises snapshot-and-write so the file always ends on the newest
    /// snapshot.
    persist: Mutex<()>,
}

impl SharedStorage {
    pub fn in_memory() -> Self {
        Self::with_entries(BTreeMap::new(), None)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?
            }
        } else {
            BTreeMap::new()
        };
        debug!(event = "storage_open", path = %path.display(), keys = entries.len());
        Ok(Self::with_entries(entries, Some(path)))
    }

    fn with_entries(entries: BTreeMap<String, String>, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StorageInner {
                entries: RwLock::new(entries),
                path,
                events,
                next_origin: AtomicU64::new(0),
                persist: Mutex::new(()),
            }),
        }
    }

    /// A new tab's view of the store.
    pub fn tab(&self) -> StorageHandle {
        let origin = self.inner.next_origin.fetch_add(1, Ordering::SeqCst) + 1;
        StorageHandle {
            storage: self.clone(),
            origin,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn mutate(&self, origin: u64, key: &str, value: Option<String>) -> Result<(), StorageError> {
        {
            let mut entries = self
                .inner
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match &value {
                Some(value) => {
                    entries.insert(key.to_string(), value.clone());
                }
                None => {
                    if entries.remove(key).is_none() {
                        return Ok(());
                    }
                }
            }
        }

        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
            new_value: value,
            origin,
        });

        match self.inner.path.as_ref() {
            Some(path) => self.persist(path),
            None => Ok(()),
        }
    }

    fn persist(&self, path: &Path) -> Result<(), StorageError> {
        let _writing = self
            .inner
            .persist
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        write_atomic(path, &entries)
    }
}

fn write_atomic(path: &Path, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let raw = serde_json::to_vec_pretty(entries)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, raw)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// One tab's handle on [`SharedStorage`].
#[derive(Clone)]
pub struct StorageHandle {
    storage: SharedStorage,
    origin: u64,
}

impl StorageHandle {
    pub fn get(&self, key: &str) -> Option<String> {
        self.storage.get(key)
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), StorageError> {
        self.storage.mutate(self.origin, key, Some(value.into()))
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.storage.mutate(self.origin, key, None)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(event = "storage_parse_error", key = key, error = %err);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw =
            serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.set(key, raw)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.storage
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Mutations made by other tabs, in the order they happened.
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            rx: self.storage.inner.events.subscribe(),
            origin: self.origin,
        }
    }

    pub fn shared(&self) -> &SharedStorage {
        &self.storage
    }
}

pub struct StorageSubscription {
    rx: broadcast::Receiver<StorageEvent>,
    origin: u64,
}

impl StorageSubscription {
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.origin => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "storage_events_lagged", skipped = skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
