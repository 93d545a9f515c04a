//! Bodies exchanged on the `/api/cockpit` HTTP surface.

use crate::{Participant, WidgetState};
use serde::{Deserialize, Serialize};

pub const API_PREFIX: &str = "/api/cockpit";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHello {
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub success: bool,
    #[serde(default)]
    pub state: WidgetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilots: Option<Vec<Participant>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    pub updates: WidgetState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateQuery {
    #[serde(default)]
    pub since: u64,
}

/// Present only when the server holds something newer than `since`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<WidgetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub code: String,
    pub participants: usize,
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionsResponse {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub error: String,
}

/// One call on the session API. The session id is always kept as a single
/// path segment, so ids with `/`, `?` or `#` can't reshape the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
    Create,
    Join(&'a str),
    Leave(&'a str),
    Sync(&'a str),
    State(&'a str),
    Sessions,
}

impl<'a> Endpoint<'a> {
    /// Path segments below the server root, unescaped.
    pub fn segments(&self) -> Vec<&'a str> {
        let (action, session_id) = match *self {
            Endpoint::Create => ("create", None),
            Endpoint::Join(id) => ("join", Some(id)),
            Endpoint::Leave(id) => ("leave", Some(id)),
            Endpoint::Sync(id) => ("sync", Some(id)),
            Endpoint::State(id) => ("state", Some(id)),
            Endpoint::Sessions => ("sessions", None),
        };
        let mut segments: Vec<&'a str> = API_PREFIX.split('/').filter(|s| !s.is_empty()).collect();
        segments.push(action);
        segments.extend(session_id);
        segments
    }
}
