//! Wire protocol types and validation for the callwatch monitoring client.
//!
//! This crate is shared by the core and the console to prevent schema drift.
//! The backend remains the authority on what it emits, but both sides of the
//! client reuse the same types to decode push frames and build requests.
//!
//! The push channel is a Socket.IO server; [`Packet`] is the text codec for
//! it. Event payloads and ack bodies are the typed structs in this crate.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

mod events;
mod requests;
mod rest;
mod socketio;

pub use events::{
    parse_push_event, CallEnded, CallStarted, CallerInfo, ContextMessage, HitlContext,
    HitlRequested, HitlResolved, HitlTimeout, PushEvent, RagResult, SttTranscript, TtsCompleted,
    TtsStarted, Urgency,
};
pub use requests::{CallAck, SubmitHitlResponse, SubscribeCall, UnsubscribeCall};
pub use rest::{
    ActiveCallRecord, OperatorStatus, OperatorStatusResponse, OperatorStatusUpdate, Participant,
    DEFAULT_AWAY_MESSAGE,
};
pub use socketio::{decode_packet, engine_io_url, EngineHandshake, Packet, ENGINE_IO_PATH};

pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB

pub const EVENT_CALL_STARTED: &str = "call_started";
pub const EVENT_CALL_ENDED: &str = "call_ended";
pub const EVENT_STT_TRANSCRIPT: &str = "stt_transcript";
pub const EVENT_TTS_STARTED: &str = "tts_started";
pub const EVENT_TTS_COMPLETED: &str = "tts_completed";
pub const EVENT_HITL_REQUESTED: &str = "hitl_requested";
pub const EVENT_HITL_RESOLVED: &str = "hitl_resolved";
pub const EVENT_HITL_TIMEOUT: &str = "hitl_timeout";

pub const REQUEST_SUBSCRIBE_CALL: &str = "subscribe_call";
pub const REQUEST_UNSUBSCRIBE_CALL: &str = "unsubscribe_call";
pub const REQUEST_SUBMIT_HITL_RESPONSE: &str = "submit_hitl_response";

/// Every push event the client consumes, in the order the core registers them.
pub const PUSH_EVENT_NAMES: [&str; 8] = [
    EVENT_CALL_STARTED,
    EVENT_CALL_ENDED,
    EVENT_STT_TRANSCRIPT,
    EVENT_TTS_STARTED,
    EVENT_TTS_COMPLETED,
    EVENT_HITL_REQUESTED,
    EVENT_HITL_RESOLVED,
    EVENT_HITL_TIMEOUT,
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Parses backend timestamps. The backend emits RFC 3339 most of the time but
/// some emitters drop the offset; those are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

pub(crate) fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_rfc3339_and_naive_timestamps() {
        let with_offset = parse_timestamp("2026-01-05T18:00:00+09:00").expect("offset");
        assert_eq!(with_offset.hour(), 9);

        let naive = parse_timestamp("2026-01-05T18:00:05.123456").expect("naive");
        assert_eq!(naive.day(), 5);
        assert_eq!(naive.hour(), 18);

        assert!(parse_timestamp("yesterday").is_none());
    }
}
