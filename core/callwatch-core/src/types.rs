//! Session records held by the registry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use callwatch_protocol::{parse_timestamp, ActiveCallRecord, CallStarted};

use crate::patterns::display_identity;

/// One live call as the operator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    /// Display identity of the caller (user-part of the address).
    pub caller: String,
    pub callee: String,
    pub caller_uri: String,
    pub callee_uri: String,
    pub caller_name: Option<String>,
    pub callee_name: Option<String>,
    pub ai_handled: bool,
    /// Backend-reported status (`ringing`, `active`, `on-hold`, `ending`).
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub current_question: Option<String>,
    pub ai_confidence: Option<f64>,
    pub needs_hitl: bool,
}

impl CallSession {
    /// Builds a session from a snapshot row. The backend reports elapsed
    /// seconds rather than a start time, so the start is derived from `now`.
    pub fn from_record(record: &ActiveCallRecord, now: DateTime<Utc>) -> Self {
        let elapsed = i64::try_from(record.duration).unwrap_or(i64::MAX);
        let started_at = now
            .checked_sub_signed(Duration::seconds(elapsed))
            .unwrap_or(now);
        Self {
            id: record.call_id.clone(),
            caller: display_identity(&record.caller.uri),
            callee: display_identity(&record.callee.uri),
            caller_uri: record.caller.uri.clone(),
            callee_uri: record.callee.uri.clone(),
            caller_name: record.caller.name.clone(),
            callee_name: record.callee.name.clone(),
            ai_handled: record.is_ai_handled,
            status: record.status.clone(),
            started_at,
            current_question: record.current_question.clone(),
            ai_confidence: record.ai_confidence,
            needs_hitl: record.needs_hitl.unwrap_or(false),
        }
    }

    /// Builds a session from a `call_started` push. A missing or unreadable
    /// timestamp falls back to `now`.
    pub fn from_started(event: &CallStarted, now: DateTime<Utc>) -> Self {
        let started_at = event
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        Self {
            id: event.call_id.clone(),
            caller: display_identity(&event.caller_uri),
            callee: display_identity(&event.callee_uri),
            caller_uri: event.caller_uri.clone(),
            callee_uri: event.callee_uri.clone(),
            caller_name: None,
            callee_name: None,
            ai_handled: event.is_ai_handled,
            status: "active".to_string(),
            started_at,
            current_question: None,
            ai_confidence: None,
            needs_hitl: false,
        }
    }

    /// Whole seconds since the call started, never negative.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(now.signed_duration_since(self.started_at).num_seconds()).unwrap_or(0)
    }

    /// Caller's name when known, else the display identity.
    pub fn caller_label(&self) -> &str {
        self.caller_name.as_deref().unwrap_or(&self.caller)
    }
}
