//! Bodies exchanged with the request/response API (active-call snapshot and
//! operator status).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deserialize_timestamp;

/// Away message the backend falls back to when none was ever stored.
pub const DEFAULT_AWAY_MESSAGE: &str = "Sorry, we will get back to you after checking.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Participant {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

/// One row of `GET /api/calls/active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveCallRecord {
    pub call_id: String,
    #[serde(default)]
    pub caller: Participant,
    #[serde(default)]
    pub callee: Participant,
    #[serde(default = "default_call_status")]
    pub status: String,
    #[serde(default)]
    pub is_ai_handled: bool,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub current_question: Option<String>,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub needs_hitl: Option<bool>,
}

fn default_call_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Available,
    Away,
    Busy,
    Offline,
}

impl OperatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorStatus::Available => "available",
            OperatorStatus::Away => "away",
            OperatorStatus::Busy => "busy",
            OperatorStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for OperatorStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "available" => Ok(OperatorStatus::Available),
            "away" => Ok(OperatorStatus::Away),
            "busy" => Ok(OperatorStatus::Busy),
            "offline" => Ok(OperatorStatus::Offline),
            _ => Err(format!(
                "'{}' is not one of available, away, busy, offline",
                value
            )),
        }
    }
}

impl std::fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `PUT /api/operator/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OperatorStatusUpdate {
    pub status: OperatorStatus,
    #[serde(default)]
    pub away_message: Option<String>,
}

/// Authoritative operator status returned by both status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorStatusResponse {
    #[serde(default)]
    pub operator_id: String,
    pub status: OperatorStatus,
    #[serde(default)]
    pub away_message: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub status_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub unresolved_hitl_count: u32,
}
