//! Client-side synchronization for SimGlass widgets: cross-tab channels, the
//! per-widget telemetry socket, device session sync over HTTP, and the
//! shared-cockpit room client.

pub mod channel;
pub mod connection;
pub mod device_sync;
pub mod error;
pub mod room_sync;
pub mod runtime;
pub mod settings;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{BroadcastRegistry, ChannelBackend, ChannelEvent, SafeChannel};
pub use connection::{ConnectionConfig, ConnectionState, WidgetConnection, WidgetHandler};
pub use device_sync::{DeviceSyncClient, DeviceSyncConfig, SyncEvent, SyncOutcome};
pub use error::SyncError;
pub use room_sync::{ReconnectPolicy, RoomSyncClient, RoomSyncConfig};
pub use runtime::{GlassRuntime, TabContext};
pub use settings::{SettingValue, SettingsError, SettingsSchema, WidgetSettings};
pub use storage::{SharedStorage, StorageError, StorageEvent, StorageHandle};
