//! Push events the backend delivers over the persistent connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    require_string, ErrorInfo, EVENT_CALL_ENDED, EVENT_CALL_STARTED, EVENT_HITL_REQUESTED,
    EVENT_HITL_RESOLVED, EVENT_HITL_TIMEOUT, EVENT_STT_TRANSCRIPT, EVENT_TTS_COMPLETED,
    EVENT_TTS_STARTED,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallStarted {
    pub call_id: String,
    #[serde(default)]
    pub caller_uri: String,
    #[serde(default)]
    pub callee_uri: String,
    #[serde(default)]
    pub is_ai_handled: bool,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallEnded {
    pub call_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SttTranscript {
    pub call_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsStarted {
    pub call_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsCompleted {
    pub call_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CallerInfo {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagResult {
    pub text: String,
    #[serde(default)]
    pub score: f64,
}

/// What the assistant knew when it asked for help.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HitlContext {
    #[serde(default, alias = "caller_info")]
    pub caller_info: CallerInfo,
    #[serde(default, alias = "previous_messages")]
    pub previous_messages: Vec<ContextMessage>,
    #[serde(default, alias = "rag_results")]
    pub rag_results: Vec<RagResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitlRequested {
    pub call_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub context: HitlContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitlResolved {
    pub call_id: String,
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitlTimeout {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    CallStarted(CallStarted),
    CallEnded(CallEnded),
    SttTranscript(SttTranscript),
    TtsStarted(TtsStarted),
    TtsCompleted(TtsCompleted),
    HitlRequested(HitlRequested),
    HitlResolved(HitlResolved),
    HitlTimeout(HitlTimeout),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::CallStarted(_) => EVENT_CALL_STARTED,
            PushEvent::CallEnded(_) => EVENT_CALL_ENDED,
            PushEvent::SttTranscript(_) => EVENT_STT_TRANSCRIPT,
            PushEvent::TtsStarted(_) => EVENT_TTS_STARTED,
            PushEvent::TtsCompleted(_) => EVENT_TTS_COMPLETED,
            PushEvent::HitlRequested(_) => EVENT_HITL_REQUESTED,
            PushEvent::HitlResolved(_) => EVENT_HITL_RESOLVED,
            PushEvent::HitlTimeout(_) => EVENT_HITL_TIMEOUT,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            PushEvent::CallStarted(event) => &event.call_id,
            PushEvent::CallEnded(event) => &event.call_id,
            PushEvent::SttTranscript(event) => &event.call_id,
            PushEvent::TtsStarted(event) => &event.call_id,
            PushEvent::TtsCompleted(event) => &event.call_id,
            PushEvent::HitlRequested(event) => &event.call_id,
            PushEvent::HitlResolved(event) => &event.call_id,
            PushEvent::HitlTimeout(event) => &event.call_id,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(self.call_id(), "call_id")?;
        if self.call_id().len() > 256 {
            return Err(ErrorInfo::new(
                "invalid_call_id",
                "call_id must be 256 characters or fewer",
            ));
        }

        match self {
            PushEvent::SttTranscript(event) => require_string(&event.text, "text"),
            PushEvent::TtsStarted(event) => require_string(&event.text, "text"),
            PushEvent::HitlRequested(event) => require_string(&event.question, "question"),
            PushEvent::CallStarted(_)
            | PushEvent::CallEnded(_)
            | PushEvent::TtsCompleted(_)
            | PushEvent::HitlResolved(_)
            | PushEvent::HitlTimeout(_) => Ok(()),
        }
    }
}

/// Decodes and validates the payload of a named push event.
pub fn parse_push_event(name: &str, data: Value) -> Result<PushEvent, ErrorInfo> {
    let event = match name {
        EVENT_CALL_STARTED => PushEvent::CallStarted(decode(name, data)?),
        EVENT_CALL_ENDED => PushEvent::CallEnded(decode(name, data)?),
        EVENT_STT_TRANSCRIPT => PushEvent::SttTranscript(decode(name, data)?),
        EVENT_TTS_STARTED => PushEvent::TtsStarted(decode(name, data)?),
        EVENT_TTS_COMPLETED => PushEvent::TtsCompleted(decode(name, data)?),
        EVENT_HITL_REQUESTED => PushEvent::HitlRequested(decode(name, data)?),
        EVENT_HITL_RESOLVED => PushEvent::HitlResolved(decode(name, data)?),
        EVENT_HITL_TIMEOUT => PushEvent::HitlTimeout(decode(name, data)?),
        other => {
            return Err(ErrorInfo::new(
                "unknown_event",
                format!("unsupported push event: {}", other),
            ))
        }
    };
    event.validate()?;
    Ok(event)
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, data: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(data).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", name, err),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call_started() {
        let event = parse_push_event(
            EVENT_CALL_STARTED,
            json!({
                "call_id": "c1",
                "caller_uri": "sip:1001@pbx.local",
                "callee_uri": "sip:1002@pbx.local",
                "is_ai_handled": true,
                "timestamp": "2026-01-05T18:00:00"
            }),
        )
        .expect("parse call_started");

        match event {
            PushEvent::CallStarted(started) => {
                assert_eq!(started.call_id, "c1");
                assert_eq!(started.callee_uri, "sip:1002@pbx.local");
                assert!(started.is_ai_handled);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn tolerates_extra_fields_from_backend() {
        let event = parse_push_event(
            EVENT_CALL_ENDED,
            json!({ "call_id": "c1", "timestamp": "2026-01-05T18:00:00" }),
        )
        .expect("parse call_ended");
        assert_eq!(event.call_id(), "c1");
    }

    #[test]
    fn rejects_blank_call_id() {
        let err = parse_push_event(EVENT_CALL_ENDED, json!({ "call_id": "  " })).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_transcript_without_text() {
        let err = parse_push_event(
            EVENT_STT_TRANSCRIPT,
            json!({ "call_id": "c1", "is_final": true }),
        )
        .unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_unknown_event() {
        let err = parse_push_event("knowledge_created", json!({})).unwrap_err();
        assert_eq!(err.code, "unknown_event");
    }

    #[test]
    fn hitl_context_accepts_both_casings() {
        let camel = parse_push_event(
            EVENT_HITL_REQUESTED,
            json!({
                "call_id": "c3",
                "question": "Q",
                "urgency": "high",
                "context": {
                    "callerInfo": { "uri": "sip:1001@pbx.local", "name": "Kim" },
                    "previousMessages": [{ "role": "user", "content": "hello" }],
                    "ragResults": [{ "text": "hours are 9-6", "score": 0.82 }]
                }
            }),
        )
        .expect("camelCase context");
        let snake = parse_push_event(
            EVENT_HITL_REQUESTED,
            json!({
                "call_id": "c3",
                "question": "Q",
                "urgency": "high",
                "context": {
                    "caller_info": { "uri": "sip:1001@pbx.local", "name": "Kim" },
                    "previous_messages": [{ "role": "user", "content": "hello" }],
                    "rag_results": [{ "text": "hours are 9-6", "score": 0.82 }]
                }
            }),
        )
        .expect("snake_case context");

        assert_eq!(camel, snake);
        let PushEvent::HitlRequested(request) = camel else {
            panic!("expected hitl_requested");
        };
        assert_eq!(request.urgency, Urgency::High);
        assert_eq!(request.context.previous_messages.len(), 1);
        assert_eq!(request.context.caller_info.name.as_deref(), Some("Kim"));
    }

    #[test]
    fn hitl_request_defaults_missing_context() {
        let event = parse_push_event(
            EVENT_HITL_REQUESTED,
            json!({ "call_id": "c3", "question": "Q" }),
        )
        .expect("parse");
        let PushEvent::HitlRequested(request) = event else {
            panic!("expected hitl_requested");
        };
        assert_eq!(request.urgency, Urgency::Medium);
        assert!(request.context.rag_results.is_empty());
    }
}
