//! Device session sync over plain HTTP.
//!
//! Sessions are created and joined with single round trips; after that the
//! client polls `GET /state/:id?since=<last_update>` and only re-emits state
//! when the server reports something strictly newer. Local edits are merged
//! optimistically, fanned out to same-device tabs, then pushed to the server.

use crate::channel::{ChannelBackend, SafeChannel};
use crate::error::SyncError;
use crate::storage::StorageHandle;
use glass_core::cockpit_api::{
    ApiError, CreateSessionResponse, DeviceHello, Endpoint, JoinSessionResponse,
    LeaveSessionRequest, SessionSummary, SessionsResponse, StateResponse, SuccessResponse,
    SyncRequest,
};
use glass_core::wire::{LocalMessage, LocalStatePayload};
use glass_core::{merge_state, new_device_id, session_code, Participant, SessionRole, WidgetState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_HTTP_URL: &str = "http://localhost:8080";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEVICE_ID_KEY: &str = "cockpit-sync-device-id";
pub const SESSION_KEY: &str = "cockpit-sync-session";
pub const LOCAL_CHANNEL: &str = "cockpit-sync";
const EVENT_CAPACITY: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeviceSyncConfig {
    pub server_url: String,
    pub poll_interval: Duration,
    pub device_name: String,
}

impl Default for DeviceSyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_HTTP_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            device_name: "SimGlass".to_string(),
        }
    }
}

impl DeviceSyncConfig {
    fn validate(&self) -> Result<Url, SyncError> {
        if self.poll_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        let url = Url::parse(self.server_url.trim())?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SyncError::InvalidConfig(format!(
                "session sync needs http:// or https://, got {other}://"
            ))),
        }
    }
}

/// `{success, sessionId?, error?}` returned by every session call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn with_session(session_id: &str) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.to_string()),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SessionCreated { session_id: String },
    SessionJoined { session_id: String, participants: Vec<Participant> },
    SessionLeft { session_id: String },
    StateUpdate { state: WidgetState },
    Error { message: String },
}

/// What survives a restart under [`SESSION_KEY`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct SavedSession {
    session_id: String,
    role: SessionRole,
}

#[derive(Debug, Default)]
struct SessionCache {
    session_id: Option<String>,
    role: Option<SessionRole>,
    connected: bool,
    state: WidgetState,
    last_update: u64,
    participants: Vec<Participant>,
}

struct Shared {
    device_id: String,
    cache: Mutex<SessionCache>,
    events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn cache(&self) -> std::sync::MutexGuard<'_, SessionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        warn!(event = "device_sync_error", device_id = %self.device_id, error = %message);
        self.emit(SyncEvent::Error { message });
    }

    fn apply_local(&self, payload: LocalStatePayload) {
        if payload.source == self.device_id {
            return;
        }
        let merged = {
            let mut cache = self.cache();
            if payload.session_id.is_some() && payload.session_id != cache.session_id {
                return;
            }
            merge_state(&mut cache.state, &payload.state);
            cache.state.clone()
        };
        debug!(event = "device_sync_local_update", source = %payload.source);
        self.emit(SyncEvent::StateUpdate { state: merged });
    }
}

#[derive(Clone)]
pub struct DeviceSyncClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base: Url,
    config: DeviceSyncConfig,
    storage: StorageHandle,
    channel: SafeChannel,
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSyncClient {
    /// Must be called inside a tokio runtime (opens the local channel).
    pub fn new(
        config: DeviceSyncConfig,
        storage: StorageHandle,
        backend: &ChannelBackend,
    ) -> Result<Self, SyncError> {
        let base = config.validate()?;
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let device_id = load_device_id(&storage)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            device_id,
            cache: Mutex::new(SessionCache::default()),
            events,
        });

        let channel = SafeChannel::open(LOCAL_CHANNEL, backend);
        let listener = shared.clone();
        channel.set_onmessage(move |event| {
            match serde_json::from_value::<LocalMessage>(event.data) {
                Ok(LocalMessage::StateUpdate(payload)) => listener.apply_local(payload),
                Err(err) => debug!(event = "device_sync_local_parse_error", error = %err),
            }
        });

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base,
                config,
                storage,
                channel,
                shared,
                poller: Mutex::new(None),
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.shared.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.shared.cache().session_id.clone()
    }

    pub fn session_code(&self) -> Option<String> {
        self.session_id().map(|id| session_code(&id))
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.inner.shared.cache().role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.cache().connected
    }

    pub fn state(&self) -> WidgetState {
        self.inner.shared.cache().state.clone()
    }

    pub fn last_update(&self) -> u64 {
        self.inner.shared.cache().last_update
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.shared.cache().participants.clone()
    }

    pub async fn create_session(&self, device_name: &str) -> SyncOutcome {
        let body = DeviceHello {
            device_id: self.device_id().to_string(),
            device_name: device_name.to_string(),
        };
        let response: CreateSessionResponse = match self.post(Endpoint::Create, &body).await {
            Ok(value) => value,
            Err(err) => return self.fail(format!("create session failed: {err}")),
        };
        let session_id = response.session_id;
        {
            let mut cache = self.inner.shared.cache();
            *cache = SessionCache {
                session_id: Some(session_id.clone()),
                role: Some(SessionRole::Host),
                connected: true,
                participants: vec![Participant {
                    device_id: self.device_id().to_string(),
                    name: device_name.to_string(),
                    role: SessionRole::Host,
                }],
                ..SessionCache::default()
            };
        }
        self.save_session(&session_id, SessionRole::Host);
        info!(event = "session_created", session_id = %session_id, device_id = %self.device_id());
        self.inner.shared.emit(SyncEvent::SessionCreated {
            session_id: session_id.clone(),
        });
        self.start_polling();
        SyncOutcome::with_session(&session_id)
    }

    /// Joins `session_id`. A session already held is abandoned without a
    /// leave call.
    pub async fn join_session(&self, session_id: &str, device_name: &str) -> SyncOutcome {
        let body = DeviceHello {
            device_id: self.device_id().to_string(),
            device_name: device_name.to_string(),
        };
        let response: JoinSessionResponse = match self.post(Endpoint::Join(session_id), &body).await {
            Ok(value) => value,
            Err(err) => return self.fail(format!("join session failed: {err}")),
        };
        if !response.success {
            return self.fail(format!("join session {session_id} rejected"));
        }
        let participants = response.pilots.unwrap_or_default();
        {
            let mut cache = self.inner.shared.cache();
            *cache = SessionCache {
                session_id: Some(session_id.to_string()),
                role: Some(SessionRole::Guest),
                connected: true,
                state: response.state.clone(),
                last_update: response.last_update.unwrap_or_default(),
                participants: participants.clone(),
            };
        }
        self.save_session(session_id, SessionRole::Guest);
        info!(event = "session_joined", session_id = %session_id, device_id = %self.device_id());
        self.inner.shared.emit(SyncEvent::SessionJoined {
            session_id: session_id.to_string(),
            participants,
        });
        if !response.state.is_empty() {
            self.inner.shared.emit(SyncEvent::StateUpdate {
                state: response.state,
            });
        }
        self.start_polling();
        SyncOutcome::with_session(session_id)
    }

    /// Rejoins the session saved by a previous run, if any.
    pub async fn resume_session(&self) -> Option<SyncOutcome> {
        let saved: SavedSession = self.inner.storage.get_json(SESSION_KEY)?;
        let outcome = self
            .join_session(&saved.session_id, &self.inner.config.device_name)
            .await;
        if outcome.success && saved.role == SessionRole::Host {
            self.inner.shared.cache().role = Some(SessionRole::Host);
            self.save_session(&saved.session_id, SessionRole::Host);
        }
        if !outcome.success {
            let _ = self.inner.storage.remove(SESSION_KEY);
        }
        Some(outcome)
    }

    pub async fn leave_session(&self) -> SyncOutcome {
        self.stop_polling();
        let session_id = {
            let mut cache = self.inner.shared.cache();
            let session_id = cache.session_id.take();
            *cache = SessionCache::default();
            session_id
        };
        if let Err(err) = self.inner.storage.remove(SESSION_KEY) {
            warn!(event = "device_sync_storage_error", error = %err);
        }
        let Some(session_id) = session_id else {
            return SyncOutcome::ok();
        };
        let body = LeaveSessionRequest {
            device_id: self.device_id().to_string(),
        };
        let result: Result<SuccessResponse, SyncError> =
            self.post(Endpoint::Leave(&session_id), &body).await;
        self.inner.shared.emit(SyncEvent::SessionLeft {
            session_id: session_id.clone(),
        });
        info!(event = "session_left", session_id = %session_id, device_id = %self.device_id());
        match result {
            Ok(_) => SyncOutcome::ok(),
            Err(err) => self.fail(format!("leave session failed: {err}")),
        }
    }

    /// Merges `partial` locally, tells same-device tabs, then pushes it to the
    /// server. A failed push does not undo the local merge.
    pub async fn update_state(&self, partial: WidgetState) -> SyncOutcome {
        let (session_id, merged) = {
            let mut cache = self.inner.shared.cache();
            merge_state(&mut cache.state, &partial);
            (cache.session_id.clone(), cache.state.clone())
        };

        self.inner
            .channel
            .post(&LocalMessage::StateUpdate(LocalStatePayload {
                source: self.device_id().to_string(),
                session_id: session_id.clone(),
                state: merged,
            }));

        let Some(session_id) = session_id else {
            return self.fail(SyncError::NoSession.to_string());
        };
        let body = SyncRequest {
            device_id: self.device_id().to_string(),
            updates: partial,
        };
        match self
            .post::<_, SuccessResponse>(Endpoint::Sync(&session_id), &body)
            .await
        {
            Ok(response) if response.success => SyncOutcome::ok(),
            Ok(_) => self.fail("server rejected state update".to_string()),
            Err(err) => self.fail(format!("state update failed: {err}")),
        }
    }

    /// Pulls the server snapshot when it is newer than ours. Returns the new
    /// state only when it was applied.
    pub async fn fetch_state(&self) -> Option<WidgetState> {
        let (session_id, since) = {
            let cache = self.inner.shared.cache();
            (cache.session_id.clone()?, cache.last_update)
        };
        let response = match self.get_state(&session_id, since).await {
            Ok(value) => value,
            Err(err) => {
                self.inner
                    .shared
                    .emit_error(format!("fetch state failed: {err}"));
                return None;
            }
        };
        let (Some(state), Some(last_update)) = (response.state, response.last_update) else {
            return None;
        };
        {
            let mut cache = self.inner.shared.cache();
            if cache.session_id.as_deref() != Some(session_id.as_str())
                || last_update <= cache.last_update
            {
                return None;
            }
            cache.state = state.clone();
            cache.last_update = last_update;
        }
        debug!(event = "device_sync_state_applied", session_id = %session_id, last_update = last_update);
        self.inner.shared.emit(SyncEvent::StateUpdate {
            state: state.clone(),
        });
        Some(state)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SyncError> {
        let url = self.endpoint(Endpoint::Sessions)?;
        let response = self.inner.http.get(url).send().await?;
        let body: SessionsResponse = read_json(response).await?;
        Ok(body.sessions)
    }

    pub fn start_polling(&self) {
        let mut poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = DeviceSyncClient { inner };
                let active = {
                    let cache = client.inner.shared.cache();
                    cache.connected && cache.session_id.is_some()
                };
                if active {
                    client.fetch_state().await;
                }
            }
        }));
    }

    pub fn stop_polling(&self) {
        if let Some(handle) = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops polling and closes the local channel; the session itself is left
    /// as-is on the server.
    pub fn close(&self) {
        self.stop_polling();
        self.inner.channel.close();
        self.inner.shared.cache().connected = false;
    }

    fn fail(&self, message: String) -> SyncOutcome {
        self.inner.shared.emit_error(message.clone());
        SyncOutcome::failed(message)
    }

    fn save_session(&self, session_id: &str, role: SessionRole) {
        let saved = SavedSession {
            session_id: session_id.to_string(),
            role,
        };
        if let Err(err) = self.inner.storage.set_json(SESSION_KEY, &saved) {
            warn!(event = "device_sync_storage_error", error = %err);
        }
    }

    fn endpoint(&self, endpoint: Endpoint<'_>) -> Result<Url, SyncError> {
        let mut url = self.inner.base.clone();
        url.path_segments_mut()
            .map_err(|()| SyncError::InvalidConfig("server url cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(endpoint.segments());
        Ok(url)
    }

    async fn post<B, R>(&self, endpoint: Endpoint<'_>, body: &B) -> Result<R, SyncError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = self.endpoint(endpoint)?;
        let response = self.inner.http.post(url).json(body).send().await?;
        read_json(response).await
    }

    async fn get_state(&self, session_id: &str, since: u64) -> Result<StateResponse, SyncError> {
        let url = self.endpoint(Endpoint::State(session_id))?;
        let response = self
            .inner
            .http
            .get(url)
            .query(&[("since", since)])
            .send()
            .await?;
        read_json(response).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn read_json<R: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<R, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let message = match response.json::<ApiError>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(SyncError::Rejected(message));
    }
    Ok(response.json::<R>().await?)
}

fn load_device_id(storage: &StorageHandle) -> Result<String, SyncError> {
    if let Some(existing) = storage.get(DEVICE_ID_KEY) {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let device_id = new_device_id();
    storage.set(DEVICE_ID_KEY, device_id.clone())?;
    Ok(device_id)
}
