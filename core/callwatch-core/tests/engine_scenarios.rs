//! End-to-end scenarios driving MonitorEngine through scripted frames and
//! snapshot results, with a recording sink standing in for the socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use callwatch_core::{
    CallwatchError, Command, EscalationClosure, FrameSink, MonitorConfig, MonitorEngine, Notification,
    ReconnectBackoff, Resolution, SnapshotOutcome, Speaker, SubscriptionPhase,
};
use callwatch_protocol::{
    decode_packet, ActiveCallRecord, OperatorStatus, OperatorStatusResponse, Packet, Participant,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

const OPERATOR: &str = "sip:1002@pbx.local";
const TOKEN: &str = "header.payload.signature";

/// Keeps every outbound event packet as `{"event", "data", "id"}`, with
/// `id` only present on ack-bearing sends.
#[derive(Clone, Default)]
struct RecordingSink {
    frames: Arc<Mutex<Vec<Value>>>,
}

impl FrameSink for RecordingSink {
    fn send_text(&mut self, text: String) -> Result<(), String> {
        let (id, name, data) = match decode_packet(&text).map_err(|err| err.to_string())? {
            Packet::Event { id, name, data } => (id, name, data),
            other => return Err(format!("client sent a {} packet", other.kind())),
        };
        let mut frame = json!({ "event": name, "data": data });
        if let Some(id) = id {
            frame["id"] = json!(id);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

struct Harness {
    engine: MonitorEngine,
    sink: RecordingSink,
}

impl Harness {
    fn connected() -> Self {
        let mut harness = Self::offline();
        harness.open();
        harness
    }

    fn offline() -> Self {
        let config = MonitorConfig {
            operator_identity: Some(OPERATOR.to_string()),
            ..MonitorConfig::default()
        };
        let engine = MonitorEngine::with_backoff(
            &config,
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(100))
                .without_jitter(),
        );
        Self {
            engine,
            sink: RecordingSink::default(),
        }
    }

    fn open(&mut self) {
        let dial = self.engine.connect(TOKEN).expect("dial");
        assert!(self
            .engine
            .connection_opened(dial.generation, Box::new(self.sink.clone())));
    }

    fn push(&mut self, event: &str, data: Value) {
        let frame = Packet::event(event, data, None).encode().expect("encode");
        self.engine.handle_frame(&frame);
    }

    fn ack(&mut self, id: u64, data: Value) {
        let frame = Packet::Ack { id, data }.encode().expect("encode");
        self.engine.handle_frame(&frame);
    }

    fn subscription_failures(&mut self) -> usize {
        self.engine
            .take_notifications()
            .into_iter()
            .filter(|notification| matches!(notification, Notification::SubscriptionFailed { .. }))
            .count()
    }

    fn call_started(&mut self, call_id: &str, callee: &str) {
        self.push(
            "call_started",
            json!({
                "call_id": call_id,
                "caller_uri": "sip:1001@pbx.local",
                "callee_uri": callee,
                "is_ai_handled": true,
                "timestamp": "2026-01-05T18:00:00"
            }),
        );
    }

    fn snapshot(&mut self, ids: &[&str]) {
        let records = ids.iter().map(|id| record(id)).collect();
        self.engine.submit_snapshot(SnapshotOutcome::Calls(records));
    }

    fn frames(&self, event: &str) -> Vec<Value> {
        self.sink
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame["event"] == event)
            .cloned()
            .collect()
    }

    fn subscribes_for(&self, call_id: &str) -> Vec<Value> {
        self.frames("subscribe_call")
            .into_iter()
            .filter(|frame| frame["data"]["call_id"] == call_id)
            .collect()
    }

    fn ack_latest_subscribe(&mut self, call_id: &str, body: Value) {
        let request = self
            .subscribes_for(call_id)
            .last()
            .cloned()
            .expect("subscribe was sent");
        let id = request["id"].as_u64().expect("subscribe carries an ack id");
        self.ack(id, body);
    }

    fn activate(&mut self, call_id: &str) {
        self.ack_latest_subscribe(call_id, json!({ "success": true, "call_id": call_id }));
        assert_eq!(
            self.engine.subscription_phase(call_id),
            SubscriptionPhase::Active
        );
    }

    fn drain_opened_escalations(&mut self) -> usize {
        self.engine
            .take_notifications()
            .into_iter()
            .filter(|notification| matches!(notification, Notification::EscalationOpened { .. }))
            .count()
    }

    fn ids(&self) -> Vec<String> {
        self.engine
            .calls()
            .iter()
            .map(|call| call.id.clone())
            .collect()
    }
}

fn status_response(status: OperatorStatus) -> OperatorStatusResponse {
    OperatorStatusResponse {
        operator_id: "operator_123".to_string(),
        status,
        away_message: String::new(),
        status_changed_at: Utc.with_ymd_and_hms(2026, 1, 5, 18, 0, 0).unwrap(),
        unresolved_hitl_count: 0,
    }
}

fn record(call_id: &str) -> ActiveCallRecord {
    ActiveCallRecord {
        call_id: call_id.to_string(),
        caller: Participant {
            uri: "sip:1001@pbx.local".to_string(),
            ..Participant::default()
        },
        callee: Participant {
            uri: OPERATOR.to_string(),
            ..Participant::default()
        },
        status: "active".to_string(),
        is_ai_handled: true,
        duration: 5,
        current_question: None,
        ai_confidence: None,
        needs_hitl: None,
    }
}

// ─────────────────────────────────────────────────────────────────────
// Registry merge
// ─────────────────────────────────────────────────────────────────────

#[test]
fn lagging_empty_snapshot_keeps_pushed_call() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1"]);
    harness.call_started("c2", OPERATOR);
    harness.snapshot(&[]);

    assert_eq!(harness.ids(), vec!["c1", "c2"]);
}

#[test]
fn calls_for_other_operators_are_ignored() {
    let mut harness = Harness::connected();
    harness.call_started("c9", "sip:2001@pbx.local");
    assert!(harness.ids().is_empty());
    assert!(harness.frames("subscribe_call").is_empty());
}

#[test]
fn unavailable_source_empties_registry_until_next_success() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1"]);
    harness.activate("c1");

    harness.engine.submit_snapshot(SnapshotOutcome::Unavailable);
    assert!(harness.ids().is_empty());
    assert!(harness.engine.is_source_unavailable());
    assert_eq!(harness.subscribes_for("c1").len(), 1);
    assert_eq!(harness.frames("unsubscribe_call").len(), 1);

    harness.call_started("c2", OPERATOR);
    harness
        .engine
        .submit_snapshot(SnapshotOutcome::Failed("connection refused".to_string()));
    assert!(harness.ids().is_empty());

    harness.snapshot(&["c3"]);
    assert_eq!(harness.ids(), vec!["c3"]);
    assert!(!harness.engine.is_source_unavailable());
}

#[test]
fn transient_failure_leaves_registry_alone() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1", "c2"]);
    harness
        .engine
        .submit_snapshot(SnapshotOutcome::Failed("401 Unauthorized".to_string()));
    assert_eq!(harness.ids(), vec!["c1", "c2"]);
}

#[test]
fn registry_never_holds_duplicates() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    harness.call_started("c1", OPERATOR);
    harness.snapshot(&["c1", "c1", "c2"]);
    harness.call_started("c2", OPERATOR);

    assert_eq!(harness.ids(), vec!["c1", "c2"]);
    assert_eq!(harness.subscribes_for("c1").len(), 1);
    assert_eq!(harness.subscribes_for("c2").len(), 1);
}

// ─────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────

#[test]
fn pending_until_ack_names_the_call() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::Pending
    );

    harness.snapshot(&["c1"]);
    assert_eq!(harness.subscribes_for("c1").len(), 1);

    harness.activate("c1");
}

#[test]
fn call_end_unsubscribes_and_discards_transcript() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    harness.activate("c1");
    harness.push(
        "stt_transcript",
        json!({ "call_id": "c1", "text": "hello", "is_final": true }),
    );
    assert!(harness.engine.transcript("c1").is_some());

    harness.push("call_ended", json!({ "call_id": "c1" }));

    let unsubscribes = harness.frames("unsubscribe_call");
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0]["data"]["call_id"], "c1");
    assert!(unsubscribes[0].get("id").is_none());
    assert!(harness.engine.transcript("c1").is_none());
    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::None
    );
}

#[test]
fn failed_subscribe_is_retried_on_next_snapshot() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1"]);
    harness.ack_latest_subscribe("c1", json!({ "success": false, "error": "busy" }));

    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::Failed {
            reason: "busy".to_string()
        }
    );
    assert!(harness
        .engine
        .take_notifications()
        .contains(&Notification::SubscriptionFailed {
            call_id: "c1".to_string(),
            reason: "busy".to_string(),
        }));
    assert!(harness.engine.take_commands().is_empty());

    harness.snapshot(&["c1"]);
    assert_eq!(harness.subscribes_for("c1").len(), 2);
    harness.activate("c1");
}

#[test]
fn not_found_failure_schedules_one_delayed_refetch() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1", "c2"]);
    harness.ack_latest_subscribe("c1", json!({ "success": false, "error": "Call not found" }));
    harness.ack_latest_subscribe("c2", json!({ "success": false, "error": "forbidden" }));

    let commands = harness.engine.take_commands();
    assert_eq!(commands.len(), 1);
    assert!(matches!(
        &commands[0],
        Command::FetchSnapshot { owner_key, delay }
            if owner_key == OPERATOR && *delay == Duration::from_millis(1_500)
    ));
}

#[test]
fn ack_after_call_removed_does_not_resurrect() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    let request_id = harness.subscribes_for("c1")[0]["id"].as_u64().unwrap();
    harness.push("call_ended", json!({ "call_id": "c1" }));

    harness.ack(request_id, json!({ "success": true, "call_id": "c1" }));

    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::None
    );
}

#[test]
fn fragments_for_unheld_calls_are_dropped() {
    let mut harness = Harness::connected();
    harness.push(
        "stt_transcript",
        json!({ "call_id": "ghost", "text": "hello", "is_final": true }),
    );
    assert!(harness.engine.transcript("ghost").is_none());
}

#[test]
fn reconnect_resubscribes_every_call() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1", "c2"]);
    harness.activate("c1");

    let generation = harness.engine.connection_generation();
    let plan = harness
        .engine
        .connection_closed(generation, "reset by peer")
        .expect("reconnect planned");
    assert_eq!(plan.delay, Duration::from_millis(10));
    assert!(matches!(
        harness.engine.subscription_phase("c2"),
        SubscriptionPhase::Failed { .. }
    ));

    let dial = harness
        .engine
        .reconnect_due(plan.generation)
        .expect("redial");
    assert!(harness
        .engine
        .connection_opened(dial.generation, Box::new(harness.sink.clone())));

    assert_eq!(harness.subscribes_for("c1").len(), 2);
    assert_eq!(harness.subscribes_for("c2").len(), 2);
    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::Pending
    );
}

#[test]
fn offline_snapshots_defer_subscribes_until_connected() {
    let mut harness = Harness::offline();
    for _ in 0..5 {
        harness.snapshot(&["c1"]);
    }

    assert_eq!(harness.ids(), vec!["c1"]);
    assert_eq!(harness.subscription_failures(), 0);
    assert_eq!(
        harness.engine.subscription_phase("c1"),
        SubscriptionPhase::None
    );
    assert!(harness.frames("subscribe_call").is_empty());

    harness.open();
    assert_eq!(harness.subscribes_for("c1").len(), 1);
    harness.activate("c1");
}

#[test]
fn snapshots_while_reconnecting_do_not_fail_subscriptions() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1"]);
    harness.activate("c1");

    let generation = harness.engine.connection_generation();
    harness
        .engine
        .connection_closed(generation, "reset by peer")
        .expect("reconnect planned");
    harness.engine.take_notifications();

    harness.snapshot(&["c1", "c2"]);
    harness.snapshot(&["c1", "c2"]);
    assert_eq!(harness.subscription_failures(), 0);
    assert_eq!(
        harness.engine.subscription_phase("c2"),
        SubscriptionPhase::None
    );
}

// ─────────────────────────────────────────────────────────────────────
// Transcripts
// ─────────────────────────────────────────────────────────────────────

#[test]
fn transcript_keeps_finals_in_order_with_single_interim() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    harness.activate("c1");

    for (text, is_final) in [
        ("F1", true),
        ("I1", false),
        ("F2", true),
        ("I2", false),
        ("I3", false),
    ] {
        harness.push(
            "stt_transcript",
            json!({ "call_id": "c1", "text": text, "is_final": is_final }),
        );
    }
    {
        let transcript = harness.engine.transcript("c1").expect("transcript");
        assert_eq!(transcript.interim(), Some("I3"));
        assert_eq!(transcript.entries().len(), 2);
    }

    harness.push(
        "tts_started",
        json!({ "call_id": "c1", "text": "Let me check", "timestamp": "2026-01-05T18:00:09Z" }),
    );
    let transcript = harness.engine.transcript("c1").expect("transcript");
    let texts: Vec<&str> = transcript
        .entries()
        .iter()
        .map(|entry| entry.text.as_str())
        .collect();
    assert_eq!(texts, vec!["F1", "F2", "Let me check"]);
    assert_eq!(transcript.entries()[2].speaker, Speaker::Assistant);
    assert!(transcript.is_assistant_speaking());
    assert_eq!(transcript.interim(), None);

    harness.push("tts_completed", json!({ "call_id": "c1" }));
    assert!(!harness
        .engine
        .transcript("c1")
        .unwrap()
        .is_assistant_speaking());
}

#[test]
fn invalid_payloads_are_dropped() {
    let mut harness = Harness::connected();
    harness.push("call_started", json!({ "call_id": "" }));
    harness.push("call_started", json!({ "caller_uri": "sip:1@x" }));
    harness.engine.handle_frame("not json at all");
    assert!(harness.ids().is_empty());
}

// ─────────────────────────────────────────────────────────────────────
// Escalations
// ─────────────────────────────────────────────────────────────────────

#[test]
fn escalation_first_request_wins_and_resolve_removes() {
    let mut harness = Harness::connected();
    harness.push(
        "hitl_requested",
        json!({ "call_id": "c3", "question": "Q", "urgency": "high" }),
    );
    harness.push(
        "hitl_requested",
        json!({ "call_id": "c3", "question": "Q2" }),
    );
    assert_eq!(harness.engine.escalation_count(), 1);
    assert_eq!(harness.engine.escalation("c3").unwrap().question, "Q");

    harness
        .engine
        .resolve_escalation("c3", Resolution::answer("We open at nine").saved_as("faq"))
        .expect("resolve");
    assert_eq!(harness.engine.escalation_count(), 0);

    let submissions = harness.frames("submit_hitl_response");
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0]["data"],
        json!({
            "call_id": "c3",
            "response_text": "We open at nine",
            "save_to_kb": true,
            "category": "faq"
        })
    );

    let err = harness
        .engine
        .resolve_escalation("c3", Resolution::answer("again"))
        .unwrap_err();
    assert!(err.to_string().contains("c3"));
    assert_eq!(harness.frames("submit_hitl_response").len(), 1);
}

#[test]
fn escalation_closed_by_backend_events() {
    let mut harness = Harness::connected();
    harness.push("hitl_requested", json!({ "call_id": "c1", "question": "A" }));
    harness.push("hitl_requested", json!({ "call_id": "c2", "question": "B" }));
    assert_eq!(harness.drain_opened_escalations(), 2);

    harness.push("hitl_resolved", json!({ "call_id": "c1", "operator": "other" }));
    harness.push("hitl_timeout", json!({ "call_id": "c2" }));
    assert_eq!(harness.engine.escalation_count(), 0);
    assert_eq!(
        harness.engine.take_notifications(),
        vec![
            Notification::EscalationClosed {
                call_id: "c1".to_string(),
                closure: EscalationClosure::ResolvedElsewhere,
            },
            Notification::EscalationClosed {
                call_id: "c2".to_string(),
                closure: EscalationClosure::TimedOut,
            },
        ]
    );
}

#[test]
fn blank_answer_keeps_escalation_open() {
    let mut harness = Harness::connected();
    harness.push("hitl_requested", json!({ "call_id": "c3", "question": "Q" }));
    assert!(harness
        .engine
        .resolve_escalation("c3", Resolution::answer("  "))
        .is_err());
    assert_eq!(harness.engine.escalation_count(), 1);
    assert!(harness.frames("submit_hitl_response").is_empty());
}

// ─────────────────────────────────────────────────────────────────────
// Availability
// ─────────────────────────────────────────────────────────────────────

#[test]
fn availability_mirrors_authoritative_response() {
    let mut harness = Harness::offline();
    assert!(!harness.engine.availability().is_confirmed());

    harness
        .engine
        .set_availability(OperatorStatus::Away, Some("out".to_string()))
        .expect("request change");
    let commands = harness.engine.take_commands();
    let Command::UpdateAvailability(update) = &commands[0] else {
        panic!("expected an update command, got {:?}", commands);
    };
    assert_eq!(update.away_message.as_deref(), Some("out"));
    assert_eq!(
        harness.engine.availability().current().status,
        OperatorStatus::Offline
    );

    let response = OperatorStatusResponse {
        operator_id: "operator_123".to_string(),
        status: OperatorStatus::Away,
        away_message: "out".to_string(),
        status_changed_at: Utc.with_ymd_and_hms(2026, 1, 5, 18, 0, 0).unwrap(),
        unresolved_hitl_count: 2,
    };
    harness.engine.availability_updated(response);

    let current = harness.engine.availability().current();
    assert!(harness.engine.availability().is_confirmed());
    assert_eq!(current.status, OperatorStatus::Away);
    assert_eq!(current.away_message, "out");
    assert_eq!(current.unresolved_escalations, 2);
    assert!(harness.engine.pending_availability().is_none());
}

#[test]
fn status_fetch_does_not_settle_a_pending_change() {
    let mut harness = Harness::offline();
    harness.engine.refresh_availability();
    harness
        .engine
        .set_availability(OperatorStatus::Away, None)
        .expect("request change");
    let commands = harness.engine.take_commands();
    let Command::FetchAvailability { round_trip } = &commands[0] else {
        panic!("expected a fetch command, got {:?}", commands);
    };

    assert!(harness
        .engine
        .availability_fetched(*round_trip, status_response(OperatorStatus::Offline)));
    assert!(harness.engine.pending_availability().is_some());
    assert!(matches!(
        harness.engine.set_availability(OperatorStatus::Busy, None),
        Err(CallwatchError::StatusChangeInFlight)
    ));
}

#[test]
fn late_status_fetch_does_not_overwrite_update_echo() {
    let mut harness = Harness::offline();
    harness.engine.refresh_availability();
    harness
        .engine
        .set_availability(OperatorStatus::Busy, None)
        .expect("request change");
    let commands = harness.engine.take_commands();
    let Command::FetchAvailability { round_trip } = &commands[0] else {
        panic!("expected a fetch command, got {:?}", commands);
    };

    harness
        .engine
        .availability_updated(status_response(OperatorStatus::Busy));
    harness.engine.take_notifications();
    assert!(!harness
        .engine
        .availability_fetched(*round_trip, status_response(OperatorStatus::Offline)));

    assert_eq!(
        harness.engine.availability().current().status,
        OperatorStatus::Busy
    );
    assert!(harness.engine.take_notifications().is_empty());
}

#[test]
fn availability_failure_is_surfaced() {
    let mut harness = Harness::offline();
    harness
        .engine
        .set_availability(OperatorStatus::Available, None)
        .expect("request change");
    let err = harness.engine.availability_failed("503 Service Unavailable");
    assert!(err.to_string().contains("503"));
    assert!(!harness.engine.availability().is_confirmed());
}

// ─────────────────────────────────────────────────────────────────────
// Inspection and teardown
// ─────────────────────────────────────────────────────────────────────

#[test]
fn registry_emptied_clears_inspection() {
    let mut harness = Harness::connected();
    harness.call_started("c1", OPERATOR);
    harness.activate("c1");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    harness
        .engine
        .inspect("c1", move |event| {
            sink.lock().unwrap().push(event.call_id().to_string())
        })
        .expect("inspect");
    assert_eq!(harness.engine.inspected_call(), Some("c1"));

    harness.push(
        "stt_transcript",
        json!({ "call_id": "c1", "text": "hi", "is_final": false }),
    );
    assert_eq!(*seen.lock().unwrap(), vec!["c1"]);

    harness.engine.take_notifications();
    harness.push("call_ended", json!({ "call_id": "c1" }));
    assert_eq!(harness.engine.inspected_call(), None);
    let notifications = harness.engine.take_notifications();
    assert!(notifications.contains(&Notification::RegistryEmptied));
    assert!(notifications.contains(&Notification::InspectionClosed {
        call_id: "c1".to_string()
    }));
}

#[test]
fn inspecting_unknown_call_fails() {
    let mut harness = Harness::connected();
    assert!(harness.engine.inspect("nope", |_| {}).is_err());
}

#[test]
fn teardown_unsubscribes_and_disconnects() {
    let mut harness = Harness::connected();
    harness.snapshot(&["c1", "c2", "c3"]);
    harness.activate("c1");
    harness.ack_latest_subscribe("c3", json!({ "success": false, "error": "busy" }));

    harness.engine.teardown();

    let unsubscribed: Vec<String> = harness
        .frames("unsubscribe_call")
        .iter()
        .map(|frame| frame["data"]["call_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(unsubscribed, vec!["c1", "c2"]);
    assert!(!harness.engine.sample_liveness());

    let before = harness.ids().len();
    harness.call_started("c4", OPERATOR);
    assert_eq!(harness.ids().len(), before);
}
