//! Open human-assistance requests, oldest first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use callwatch_protocol::{parse_timestamp, HitlContext, HitlRequested, SubmitHitlResponse, Urgency};

use crate::error::{CallwatchError, Result};

/// Knowledge-base categories the backend files saved answers under.
pub const KB_CATEGORIES: [&str; 5] = ["faq", "schedule", "policy", "contact", "other"];

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationRequest {
    pub call_id: String,
    pub question: String,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub context: HitlContext,
}

impl EscalationRequest {
    pub fn from_event(event: HitlRequested, now: DateTime<Utc>) -> Self {
        let created_at = event
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        Self {
            call_id: event.call_id,
            question: event.question,
            urgency: event.urgency,
            created_at,
            context: event.context,
        }
    }
}

/// The operator's answer to an escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub answer: String,
    /// `Some(category)` saves the answer to the knowledge base.
    pub knowledge_base: Option<String>,
}

impl Resolution {
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            knowledge_base: None,
        }
    }

    pub fn saved_as(mut self, category: impl Into<String>) -> Self {
        self.knowledge_base = Some(category.into());
        self
    }
}

/// How an escalation left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationClosure {
    Answered,
    ResolvedElsewhere,
    TimedOut,
}

impl EscalationClosure {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationClosure::Answered => "answered",
            EscalationClosure::ResolvedElsewhere => "resolved_elsewhere",
            EscalationClosure::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Default)]
pub struct EscalationQueue {
    open: VecDeque<EscalationRequest>,
}

impl EscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `request` unless one is already open for the call.
    pub fn enqueue(&mut self, request: EscalationRequest) -> bool {
        if self.get(&request.call_id).is_some() {
            debug!(call_id = %request.call_id, "Escalation already open; new request ignored");
            return false;
        }
        info!(
            call_id = %request.call_id,
            urgency = request.urgency.as_str(),
            "Escalation opened"
        );
        self.open.push_back(request);
        true
    }

    /// Accepts the operator's answer, removing the request and returning the
    /// submission to send. Nothing changes when the answer is rejected.
    pub fn resolve(&mut self, call_id: &str, resolution: Resolution) -> Result<SubmitHitlResponse> {
        let position = self
            .position(call_id)
            .ok_or_else(|| CallwatchError::EscalationNotFound(call_id.to_string()))?;

        let answer = resolution.answer.trim();
        if answer.is_empty() {
            return Err(CallwatchError::InvalidResolution(
                "answer must not be blank".to_string(),
            ));
        }
        let category = match resolution.knowledge_base {
            Some(category) => Some(normalize_category(&category)?),
            None => None,
        };

        let submission = SubmitHitlResponse {
            call_id: call_id.to_string(),
            response_text: answer.to_string(),
            save_to_kb: category.is_some(),
            category,
        };
        submission
            .validate()
            .map_err(|err| CallwatchError::InvalidResolution(err.message))?;

        self.open.remove(position);
        info!(call_id, save_to_kb = submission.save_to_kb, "Escalation answered");
        Ok(submission)
    }

    /// Removes the request for `call_id` without an answer from this client.
    pub fn close(&mut self, call_id: &str, closure: EscalationClosure) -> Option<EscalationRequest> {
        let position = self.position(call_id)?;
        let request = self.open.remove(position);
        info!(call_id, closure = closure.as_str(), "Escalation closed");
        request
    }

    pub fn get(&self, call_id: &str) -> Option<&EscalationRequest> {
        self.open.iter().find(|request| request.call_id == call_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EscalationRequest> {
        self.open.iter()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn position(&self, call_id: &str) -> Option<usize> {
        self.open
            .iter()
            .position(|request| request.call_id == call_id)
    }
}

fn normalize_category(category: &str) -> Result<String> {
    let normalized = category.trim().to_ascii_lowercase();
    if KB_CATEGORIES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(CallwatchError::InvalidResolution(format!(
            "unknown knowledge-base category: {}",
            category.trim()
        )))
    }
}
