//! `/api/cockpit` device sessions: shared widget state polled over HTTP.

use crate::RelayState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use glass_core::cockpit_api::{
    ApiError, CreateSessionResponse, DeviceHello, JoinSessionResponse, LeaveSessionRequest,
    SessionSummary, SessionsResponse, StateQuery, StateResponse, SuccessResponse, SyncRequest,
    API_PREFIX,
};
use glass_core::{merge_state, now_ms, session_code, Participant, SessionRole, WidgetState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct CockpitSession {
    code: String,
    participants: Vec<Participant>,
    state: WidgetState,
    last_update: u64,
    last_seen: Instant,
}

impl CockpitSession {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Strictly increasing even when two writes land in the same millisecond.
    fn bump(&mut self) {
        self.last_update = now_ms().max(self.last_update + 1);
    }
}

#[derive(Default)]
pub struct CockpitStore {
    sessions: RwLock<HashMap<String, CockpitSession>>,
}

impl CockpitStore {
    pub async fn create(&self, hello: &DeviceHello) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = CockpitSession {
            code: session_code(&session_id),
            participants: vec![Participant {
                device_id: hello.device_id.clone(),
                name: hello.device_name.clone(),
                role: SessionRole::Host,
            }],
            state: WidgetState::new(),
            last_update: 0,
            last_seen: Instant::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        info!(event = "session_created", session_id = %session_id, device_id = %hello.device_id);
        session_id
    }

    pub async fn join(&self, session_id: &str, hello: &DeviceHello) -> Option<JoinSessionResponse> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.touch();
        match session
            .participants
            .iter_mut()
            .find(|p| p.device_id == hello.device_id)
        {
            Some(existing) => existing.name = hello.device_name.clone(),
            None => session.participants.push(Participant {
                device_id: hello.device_id.clone(),
                name: hello.device_name.clone(),
                role: SessionRole::Guest,
            }),
        }
        info!(
            event = "session_joined",
            session_id = session_id,
            device_id = %hello.device_id,
            participants = session.participants.len()
        );
        Some(JoinSessionResponse {
            success: true,
            state: session.state.clone(),
            pilots: Some(session.participants.clone()),
            last_update: Some(session.last_update),
        })
    }

    /// Returns `false` for an unknown session. The session is dropped once
    /// its last participant leaves.
    pub async fn leave(&self, session_id: &str, device_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.participants.retain(|p| p.device_id != device_id);
        let empty = session.participants.is_empty();
        if empty {
            sessions.remove(session_id);
        }
        info!(event = "session_left", session_id = session_id, device_id = device_id, closed = empty);
        true
    }

    pub async fn sync(&self, session_id: &str, request: &SyncRequest) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        merge_state(&mut session.state, &request.updates);
        session.bump();
        session.touch();
        debug!(
            event = "session_sync",
            session_id = session_id,
            device_id = %request.device_id,
            keys = request.updates.len(),
            last_update = session.last_update
        );
        true
    }

    /// `None` for an unknown session; an empty response when nothing is
    /// newer than `since`.
    pub async fn state_since(&self, session_id: &str, since: u64) -> Option<StateResponse> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.touch();
        if session.last_update > since {
            Some(StateResponse {
                state: Some(session.state.clone()),
                last_update: Some(session.last_update),
            })
        } else {
            Some(StateResponse::default())
        }
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, session)| SessionSummary {
                session_id: id.clone(),
                code: session.code.clone(),
                participants: session.participants.len(),
                last_update: session.last_update,
            })
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    pub async fn reap(&self, stale_after: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_seen.elapsed() <= stale_after;
            if !keep {
                warn!(event = "session_expired", session_id = %id);
            }
            keep
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

pub struct ApiFailure {
    status: StatusCode,
    message: String,
}

impl ApiFailure {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Session not found".to_string(),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiError {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub fn routes() -> Router<Arc<RelayState>> {
    Router::new()
        .route(&format!("{API_PREFIX}/create"), post(create))
        .route(&format!("{API_PREFIX}/join/:session_id"), post(join))
        .route(&format!("{API_PREFIX}/leave/:session_id"), post(leave))
        .route(&format!("{API_PREFIX}/sync/:session_id"), post(sync))
        .route(&format!("{API_PREFIX}/state/:session_id"), get(state))
        .route(&format!("{API_PREFIX}/sessions"), get(sessions))
}

fn require_device(device_id: &str) -> Result<(), ApiFailure> {
    if device_id.trim().is_empty() {
        return Err(ApiFailure::bad_request("deviceId is required"));
    }
    Ok(())
}

async fn create(
    State(relay): State<Arc<RelayState>>,
    Json(hello): Json<DeviceHello>,
) -> Result<Json<CreateSessionResponse>, ApiFailure> {
    require_device(&hello.device_id)?;
    let session_id = relay.cockpit.create(&hello).await;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn join(
    State(relay): State<Arc<RelayState>>,
    Path(session_id): Path<String>,
    Json(hello): Json<DeviceHello>,
) -> Result<Json<JoinSessionResponse>, ApiFailure> {
    require_device(&hello.device_id)?;
    relay
        .cockpit
        .join(&session_id, &hello)
        .await
        .map(Json)
        .ok_or_else(ApiFailure::not_found)
}

async fn leave(
    State(relay): State<Arc<RelayState>>,
    Path(session_id): Path<String>,
    Json(request): Json<LeaveSessionRequest>,
) -> Result<Json<SuccessResponse>, ApiFailure> {
    if relay.cockpit.leave(&session_id, &request.device_id).await {
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(ApiFailure::not_found())
    }
}

async fn sync(
    State(relay): State<Arc<RelayState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SuccessResponse>, ApiFailure> {
    require_device(&request.device_id)?;
    if relay.cockpit.sync(&session_id, &request).await {
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(ApiFailure::not_found())
    }
}

async fn state(
    State(relay): State<Arc<RelayState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StateQuery>,
) -> Result<Json<StateResponse>, ApiFailure> {
    relay
        .cockpit
        .state_since(&session_id, query.since)
        .await
        .map(Json)
        .ok_or_else(ApiFailure::not_found)
}

async fn sessions(State(relay): State<Arc<RelayState>>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: relay.cockpit.summaries().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello(device_id: &str, name: &str) -> DeviceHello {
        DeviceHello {
            device_id: device_id.to_string(),
            device_name: name.to_string(),
        }
    }

    fn updates(value: serde_json::Value) -> WidgetState {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn host_then_guest_roster() {
        let store = CockpitStore::default();
        let id = store.create(&hello("dev-a", "Laptop")).await;
        let joined = store.join(&id, &hello("dev-b", "Tablet")).await.expect("join");
        let pilots = joined.pilots.expect("pilots");
        assert_eq!(pilots.len(), 2);
        assert_eq!(pilots[0].role, SessionRole::Host);
        assert_eq!(pilots[1].role, SessionRole::Guest);

        let again = store.join(&id, &hello("dev-b", "Tablet 2")).await.expect("rejoin");
        assert_eq!(again.pilots.expect("pilots").len(), 2);
    }

    #[tokio::test]
    async fn last_update_is_strictly_increasing() {
        let store = CockpitStore::default();
        let id = store.create(&hello("dev-a", "Laptop")).await;
        let mut previous = 0;
        for n in 0..20 {
            let request = SyncRequest {
                device_id: "dev-a".to_string(),
                updates: updates(json!({"fuel": {"left": n}})),
            };
            assert!(store.sync(&id, &request).await);
            let response = store.state_since(&id, previous).await.expect("known");
            let last = response.last_update.expect("newer");
            assert!(last > previous);
            previous = last;
        }
    }

    #[tokio::test]
    async fn state_since_is_empty_when_nothing_newer() {
        let store = CockpitStore::default();
        let id = store.create(&hello("dev-a", "Laptop")).await;
        assert_eq!(store.state_since(&id, 0).await, Some(StateResponse::default()));

        let request = SyncRequest {
            device_id: "dev-a".to_string(),
            updates: updates(json!({"autopilot": {"hdg": 270}})),
        };
        store.sync(&id, &request).await;
        let newer = store.state_since(&id, 0).await.expect("known");
        let stamp = newer.last_update.expect("stamp");
        assert_eq!(newer.state.expect("state")["autopilot"], json!({"hdg": 270}));
        assert_eq!(store.state_since(&id, stamp).await, Some(StateResponse::default()));
        assert!(store.state_since("missing", 0).await.is_none());
    }

    #[tokio::test]
    async fn last_leave_closes_the_session() {
        let store = CockpitStore::default();
        let id = store.create(&hello("dev-a", "Laptop")).await;
        store.join(&id, &hello("dev-b", "Tablet")).await;
        assert!(store.leave(&id, "dev-a").await);
        assert_eq!(store.len().await, 1);
        assert!(store.leave(&id, "dev-b").await);
        assert_eq!(store.len().await, 0);
        assert!(!store.leave(&id, "dev-b").await);
    }

    #[tokio::test]
    async fn reaper_drops_idle_sessions() {
        let store = CockpitStore::default();
        store.create(&hello("dev-a", "Laptop")).await;
        assert_eq!(store.reap(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.reap(Duration::from_millis(5)).await, 1);
        assert!(store.summaries().await.is_empty());
    }
}
