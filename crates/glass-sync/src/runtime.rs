//! Application root. One `GlassRuntime` per browser-profile analogue; every
//! tab built from it shares the same storage and broadcast registry.

use crate::channel::{BroadcastRegistry, ChannelBackend, SafeChannel};
use crate::connection::{ConnectionConfig, WidgetConnection, WidgetHandler};
use crate::device_sync::{DeviceSyncClient, DeviceSyncConfig};
use crate::error::SyncError;
use crate::settings::{SettingsSchema, WidgetSettings};
use crate::storage::{SharedStorage, StorageError, StorageHandle};
use std::path::Path;

#[derive(Clone)]
pub struct GlassRuntime {
    storage: SharedStorage,
    broadcast: Option<BroadcastRegistry>,
}

impl GlassRuntime {
    pub fn in_memory() -> Self {
        Self {
            storage: SharedStorage::in_memory(),
            broadcast: Some(BroadcastRegistry::new()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            storage: SharedStorage::open(path)?,
            broadcast: Some(BroadcastRegistry::new()),
        })
    }

    /// Channels fall back to storage-event transport.
    pub fn without_broadcast(storage: SharedStorage) -> Self {
        Self {
            storage,
            broadcast: None,
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn has_broadcast(&self) -> bool {
        self.broadcast.is_some()
    }

    pub fn tab(&self) -> TabContext {
        let storage = self.storage.tab();
        let backend = match &self.broadcast {
            Some(registry) => ChannelBackend::Native(registry.clone()),
            None => ChannelBackend::Storage(storage.clone()),
        };
        TabContext { storage, backend }
    }
}

/// Everything one tab needs to build its widgets.
#[derive(Clone)]
pub struct TabContext {
    storage: StorageHandle,
    backend: ChannelBackend,
}

impl TabContext {
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn backend(&self) -> &ChannelBackend {
        &self.backend
    }

    pub fn open_channel(&self, name: &str) -> SafeChannel {
        SafeChannel::open(name, &self.backend)
    }

    pub fn device_sync(&self, config: DeviceSyncConfig) -> Result<DeviceSyncClient, SyncError> {
        DeviceSyncClient::new(config, self.storage.clone(), &self.backend)
    }

    pub fn widget_settings(&self, widget_id: &str, schema: SettingsSchema) -> WidgetSettings {
        WidgetSettings::load(widget_id, schema, self.storage.clone())
    }

    pub fn widget_connection<H: WidgetHandler>(
        &self,
        config: ConnectionConfig,
        handler: H,
    ) -> Result<WidgetConnection, SyncError> {
        WidgetConnection::new(config, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingValue;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn roundtrip(runtime: GlassRuntime) -> Vec<serde_json::Value> {
        let sender = runtime.tab().open_channel("fuel");
        let receiver = runtime.tab().open_channel("fuel");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        receiver.set_onmessage(move |event| sink.lock().expect("lock").push(event.data));

        sender.post_message(json!({"left": 120}));
        for _ in 0..100 {
            if !seen.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let out = seen.lock().expect("lock").clone();
        out
    }

    #[tokio::test]
    async fn tabs_talk_over_native_broadcast() {
        let runtime = GlassRuntime::in_memory();
        assert!(runtime.has_broadcast());
        assert!(runtime.tab().open_channel("fuel").is_native());
        assert_eq!(roundtrip(runtime).await, vec![json!({"left": 120})]);
    }

    #[tokio::test]
    async fn tabs_talk_over_storage_fallback() {
        let runtime = GlassRuntime::without_broadcast(SharedStorage::in_memory());
        assert!(!runtime.tab().open_channel("fuel").is_native());
        assert_eq!(roundtrip(runtime).await, vec![json!({"left": 120})]);
    }

    #[test]
    fn settings_are_shared_between_tabs() {
        let runtime = GlassRuntime::in_memory();
        let schema = SettingsSchema::new().toggle("compact", false);
        let mut first = runtime.tab().widget_settings("checklist", schema.clone());
        first.set("compact", SettingValue::Toggle(true)).expect("set");
        first.save().expect("save");

        let second = runtime.tab().widget_settings("checklist", schema);
        assert_eq!(second.toggle("compact"), Some(true));
    }

    #[test]
    fn file_backed_runtime_persists_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        {
            let runtime = GlassRuntime::open(&path).expect("open");
            runtime.tab().storage().set("cockpit-sync-device-id", "device-1").expect("set");
        }
        let runtime = GlassRuntime::open(&path).expect("reopen");
        assert_eq!(
            runtime.tab().storage().get("cockpit-sync-device-id").as_deref(),
            Some("device-1")
        );
    }
}
