//! Plain-text views of the engine's projections.

use chrono::{DateTime, Utc};

use callwatch_core::{
    AvailabilityState, CallSession, CallTranscript, EscalationRequest, MonitorEngine,
    Notification, SubscriptionPhase,
};
use callwatch_protocol::PushEvent;

pub fn render_calls(engine: &MonitorEngine, now: DateTime<Utc>) -> String {
    let calls = engine.calls();
    if calls.is_empty() {
        return if engine.is_source_unavailable() {
            "no active calls (call service unavailable)".to_string()
        } else {
            "no active calls".to_string()
        };
    }
    let mut lines = Vec::with_capacity(calls.len() + 1);
    lines.push(format!("{} active call(s):", calls.len()));
    for call in calls {
        lines.push(call_line(call, &engine.subscription_phase(&call.id), now));
    }
    lines.join("\n")
}

fn call_line(call: &CallSession, phase: &SubscriptionPhase, now: DateTime<Utc>) -> String {
    let mut line = format!(
        "  {:<12} {} -> {}  {}  {}  [{}]",
        call.id,
        call.caller_label(),
        call.callee,
        call.status,
        format_duration(call.duration_secs(now)),
        phase.as_str(),
    );
    if call.ai_handled {
        line.push_str(" ai");
    }
    if call.needs_hitl {
        line.push_str(" needs-operator");
    }
    line
}

pub fn render_queue(engine: &MonitorEngine, now: DateTime<Utc>) -> String {
    if engine.escalation_count() == 0 {
        return "no open escalations".to_string();
    }
    let mut lines = vec![format!("{} open escalation(s):", engine.escalation_count())];
    lines.extend(engine.escalations().map(|request| escalation_line(request, now)));
    lines.join("\n")
}

fn escalation_line(request: &EscalationRequest, now: DateTime<Utc>) -> String {
    let waited = u64::try_from(now.signed_duration_since(request.created_at).num_seconds())
        .unwrap_or(0);
    format!(
        "  {:<12} [{}] {} (waiting {})",
        request.call_id,
        request.urgency.as_str(),
        request.question,
        format_duration(waited),
    )
}

pub fn render_availability(state: &AvailabilityState) -> String {
    let (current, confirmed) = match state {
        AvailabilityState::Unconfirmed(current) => (current, false),
        AvailabilityState::Confirmed(current) => (current, true),
    };
    let mut line = format!("operator is {}", current.status);
    if !current.away_message.is_empty() {
        line.push_str(&format!(" - \"{}\"", current.away_message));
    }
    if current.unresolved_escalations > 0 {
        line.push_str(&format!(
            ", {} unresolved escalation(s)",
            current.unresolved_escalations
        ));
    }
    if !confirmed {
        line.push_str(" (not yet confirmed)");
    }
    line
}

pub fn render_transcript(call_id: &str, transcript: &CallTranscript) -> String {
    let mut lines = vec![format!("transcript for {}:", call_id)];
    for entry in transcript.entries() {
        lines.push(format!(
            "  {} {:>9}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.speaker.as_str(),
            entry.text
        ));
    }
    if let Some(interim) = transcript.interim_entry() {
        lines.push(format!(
            "  {} {:>9}: {} ...",
            interim.timestamp.format("%H:%M:%S"),
            interim.speaker.as_str(),
            interim.text
        ));
    }
    if transcript.is_assistant_speaking() {
        lines.push("  (assistant speaking)".to_string());
    }
    lines.join("\n")
}

/// One line for a live event on the inspected call.
pub fn render_inspected_event(event: &PushEvent) -> Option<String> {
    match event {
        PushEvent::SttTranscript(stt) if stt.is_final => {
            Some(format!("[{}] caller: {}", stt.call_id, stt.text))
        }
        PushEvent::TtsStarted(tts) => Some(format!("[{}] assistant: {}", tts.call_id, tts.text)),
        PushEvent::CallEnded(ended) => Some(format!("[{}] call ended", ended.call_id)),
        _ => None,
    }
}

pub fn render_notification(notification: &Notification) -> Option<String> {
    let line = match notification {
        Notification::CallAdded { call_id } => format!("+ call {}", call_id),
        Notification::CallRemoved { call_id } => format!("- call {}", call_id),
        Notification::RegistryEmptied => "no active calls".to_string(),
        Notification::InspectionClosed { call_id } => {
            format!("stopped following {}", call_id)
        }
        Notification::SubscriptionFailed { call_id, reason } => {
            format!("! could not follow {}: {}", call_id, reason)
        }
        Notification::EscalationOpened { call_id } => {
            format!("! operator needed on {}", call_id)
        }
        Notification::EscalationClosed { call_id, closure } => {
            format!("escalation on {} {}", call_id, closure.as_str())
        }
        Notification::LinkChanged { connected: true } => "live updates connected".to_string(),
        Notification::LinkChanged { connected: false } => {
            "live updates lost, reconnecting".to_string()
        }
        Notification::AvailabilityConfirmed { .. } => return None,
    };
    Some(line)
}

fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwatch_core::{EscalationClosure, OperatorAvailability};
    use callwatch_protocol::OperatorStatus;

    #[test]
    fn formats_short_and_long_durations() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(75), "1:15");
        assert_eq!(format_duration(3_723), "1h02m");
    }

    #[test]
    fn availability_marks_unconfirmed_state() {
        let state = AvailabilityState::Unconfirmed(OperatorAvailability::default());
        let line = render_availability(&state);
        assert!(line.starts_with("operator is offline"));
        assert!(line.ends_with("(not yet confirmed)"));
    }

    #[test]
    fn availability_shows_unresolved_count() {
        let state = AvailabilityState::Confirmed(OperatorAvailability {
            status: OperatorStatus::Available,
            away_message: String::new(),
            unresolved_escalations: 3,
            ..OperatorAvailability::default()
        });
        assert_eq!(
            render_availability(&state),
            "operator is available, 3 unresolved escalation(s)"
        );
    }

    #[test]
    fn availability_confirmation_is_not_echoed() {
        assert!(render_notification(&Notification::AvailabilityConfirmed {
            status: OperatorStatus::Busy
        })
        .is_none());
        assert_eq!(
            render_notification(&Notification::EscalationClosed {
                call_id: "c3".to_string(),
                closure: EscalationClosure::TimedOut,
            })
            .as_deref(),
            Some("escalation on c3 timed_out")
        );
    }

    #[test]
    fn empty_registry_mentions_unavailable_source() {
        let mut engine = MonitorEngine::new(&callwatch_core::MonitorConfig::default());
        assert_eq!(render_calls(&engine, Utc::now()), "no active calls");
        engine.submit_snapshot(callwatch_core::SnapshotOutcome::Unavailable);
        assert_eq!(
            render_calls(&engine, Utc::now()),
            "no active calls (call service unavailable)"
        );
    }
}
