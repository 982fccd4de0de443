//! Client-originated requests and the acks that answer them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{require_string, ErrorInfo, REQUEST_SUBMIT_HITL_RESPONSE};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubscribeCall {
    pub call_id: String,
}

impl SubscribeCall {
    pub fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
        }
    }

    pub fn payload(&self) -> Value {
        serde_json::json!({ "call_id": self.call_id })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UnsubscribeCall {
    pub call_id: String,
}

impl UnsubscribeCall {
    pub fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
        }
    }

    pub fn payload(&self) -> Value {
        serde_json::json!({ "call_id": self.call_id })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubmitHitlResponse {
    pub call_id: String,
    pub response_text: String,
    pub save_to_kb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl SubmitHitlResponse {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&self.call_id, "call_id")?;
        require_string(&self.response_text, "response_text")?;
        if !self.save_to_kb && self.category.is_some() {
            return Err(ErrorInfo::new(
                "invalid_category",
                "category is only sent when save_to_kb is set",
            ));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<Value, ErrorInfo> {
        serde_json::to_value(self).map_err(|err| {
            ErrorInfo::new(
                "encode_failed",
                format!("failed to encode {}: {}", REQUEST_SUBMIT_HITL_RESPONSE, err),
            )
        })
    }
}

/// Ack body returned for `subscribe_call` (and any other ack-bearing request).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CallAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CallAck {
    /// Malformed ack bodies are read as a failure carrying the decode error.
    pub fn from_data(data: Value) -> Self {
        serde_json::from_value(data).unwrap_or_else(|err| CallAck {
            success: false,
            call_id: None,
            error: Some(format!("malformed ack: {}", err)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_payloads_carry_only_the_call_id() {
        let expected = serde_json::json!({ "call_id": "c1" });
        assert_eq!(SubscribeCall::new("c1").payload(), expected);
        assert_eq!(UnsubscribeCall::new("c1").payload(), expected);
    }

    #[test]
    fn submission_requires_answer_text() {
        let submission = SubmitHitlResponse {
            call_id: "c3".to_string(),
            response_text: "   ".to_string(),
            save_to_kb: false,
            category: None,
        };
        assert_eq!(submission.validate().unwrap_err().code, "missing_field");
    }

    #[test]
    fn submission_payload_skips_missing_category() {
        let submission = SubmitHitlResponse {
            call_id: "c3".to_string(),
            response_text: "We open at nine".to_string(),
            save_to_kb: false,
            category: None,
        };
        let payload = submission.to_payload().expect("payload");
        assert!(payload.get("category").is_none());
        assert_eq!(payload["save_to_kb"], false);
    }

    #[test]
    fn category_without_kb_flag_is_rejected() {
        let submission = SubmitHitlResponse {
            call_id: "c3".to_string(),
            response_text: "We open at nine".to_string(),
            save_to_kb: false,
            category: Some("faq".to_string()),
        };
        assert_eq!(submission.validate().unwrap_err().code, "invalid_category");
    }

    #[test]
    fn malformed_ack_reads_as_failure() {
        let ack = CallAck::from_data(serde_json::json!({ "success": "yes" }));
        assert!(!ack.success);
        assert!(ack.error.unwrap().starts_with("malformed ack"));
    }
}
