pub mod cockpit_api;
pub mod wire;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Per-widget shared state: `widget_id -> arbitrary JSON`.
pub type WidgetState = Map<String, Value>;

pub const SESSION_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Host,
    Guest,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Host => "host",
            SessionRole::Guest => "guest",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CrewRole {
    Captain,
    FirstOfficer,
}

impl CrewRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrewRole::Captain => "captain",
            CrewRole::FirstOfficer => "first-officer",
        }
    }
}

impl fmt::Display for CrewRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrewRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "captain" => Ok(CrewRole::Captain),
            "first-officer" | "first_officer" | "firstofficer" => Ok(CrewRole::FirstOfficer),
            other => Err(format!("Unknown crew role: {other}")),
        }
    }
}

/// A device taking part in a cockpit session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub device_id: String,
    pub name: String,
    pub role: SessionRole,
}

/// A pilot seated in a shared-cockpit room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pilot {
    pub pilot_name: String,
    pub role: CrewRole,
}

/// Short shareable code for a session: the first six alphanumerics of the id,
/// uppercased.
pub fn session_code(session_id: &str) -> String {
    session_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .take(SESSION_CODE_LEN)
        .collect::<String>()
        .to_uppercase()
}

pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Shallow assign of `partial` into `target`; top-level keys replace wholesale.
pub fn merge_state(target: &mut WidgetState, partial: &WidgetState) {
    for (key, value) in partial {
        target.insert(key.clone(), value.clone());
    }
}

pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

pub fn new_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
