//! MonitorEngine - the owned store behind the operator console.
//!
//! The engine wires the components together and is the only thing that
//! mutates them. It is:
//! - **Synchronous**: the driver owns sockets, HTTP and timers, and reports
//!   results back through method calls.
//! - **Queue-driven**: pushes and acks land in the push queue, snapshot
//!   results in the poll queue; [`MonitorEngine::pump`] drains push first,
//!   then poll, each in arrival order.
//! - **Command-emitting**: work the engine cannot do itself (snapshot and
//!   availability requests) comes out of [`MonitorEngine::take_commands`].
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use callwatch_core::{MonitorConfig, MonitorEngine};
//!
//! let mut engine = MonitorEngine::new(&MonitorConfig::default());
//! let dial = engine.connect(&token)?;
//! // open the transport for `dial`, then:
//! engine.connection_opened(dial.generation, Box::new(sink));
//! engine.handle_frame(&text); // Socket.IO event and ack packets
//! for command in engine.take_commands() { /* perform it */ }
//! ```

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use callwatch_protocol::{
    parse_push_event, parse_timestamp, OperatorStatus, OperatorStatusResponse,
    OperatorStatusUpdate, PushEvent, SubscribeCall, UnsubscribeCall, PUSH_EVENT_NAMES,
    REQUEST_SUBMIT_HITL_RESPONSE, REQUEST_SUBSCRIBE_CALL, REQUEST_UNSUBSCRIBE_CALL,
};

use crate::availability::{AvailabilityState, AvailabilityTracker};
use crate::config::MonitorConfig;
use crate::connection::{
    AckOutcome, ConnectionManager, ConnectionPhase, Dial, FrameSink, HandlerId, ReconnectBackoff,
    ReconnectPlan,
};
use crate::error::{CallwatchError, Result};
use crate::escalation::{EscalationClosure, EscalationQueue, EscalationRequest, Resolution};
use crate::monitor::CallMonitor;
use crate::registry::{ActiveCallRegistry, RegistryChange, SnapshotOutcome};
use crate::subscriptions::{AckDisposition, SubscriptionCoordinator, SubscriptionPhase};
use crate::transcript::{CallTranscript, Speaker, TranscriptAggregator, TranscriptFragment};
use crate::types::CallSession;

/// Outbound work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch the active-call snapshot after `delay`, then call
    /// [`MonitorEngine::submit_snapshot`].
    FetchSnapshot { owner_key: String, delay: Duration },
    /// Fetch the operator status, then call `availability_fetched` with the
    /// same `round_trip`. A failed fetch changes nothing.
    FetchAvailability { round_trip: u64 },
    /// Send the update, then call `availability_updated` or
    /// `availability_failed`.
    UpdateAvailability(OperatorStatusUpdate),
}

/// State changes the rendering layer may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CallAdded { call_id: String },
    CallRemoved { call_id: String },
    /// The registry went empty; any inspected-call reference is stale.
    RegistryEmptied,
    InspectionClosed { call_id: String },
    SubscriptionFailed { call_id: String, reason: String },
    EscalationOpened { call_id: String },
    EscalationClosed {
        call_id: String,
        closure: EscalationClosure,
    },
    LinkChanged { connected: bool },
    AvailabilityConfirmed { status: OperatorStatus },
}

enum PushInbound {
    Event {
        name: &'static str,
        data: Value,
    },
    SubscribeAck {
        call_id: String,
        ticket: u64,
        outcome: AckOutcome,
    },
}

pub struct MonitorEngine {
    owner_key: String,
    refetch_delay: Duration,
    connection: ConnectionManager,
    registry: ActiveCallRegistry,
    subscriptions: SubscriptionCoordinator,
    transcripts: TranscriptAggregator,
    escalations: EscalationQueue,
    availability: AvailabilityTracker,
    push_tx: Sender<PushInbound>,
    push_rx: Receiver<PushInbound>,
    poll_queue: VecDeque<SnapshotOutcome>,
    commands: VecDeque<Command>,
    notifications: VecDeque<Notification>,
    installed: Vec<(&'static str, HandlerId)>,
    monitor: Option<CallMonitor>,
    link_up: bool,
    refetch_scheduled: bool,
}

impl MonitorEngine {
    pub fn new(config: &MonitorConfig) -> Self {
        let backoff = ReconnectBackoff::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
        );
        Self::with_backoff(config, backoff)
    }

    /// Builds an engine with an explicit reconnect policy.
    pub fn with_backoff(config: &MonitorConfig, backoff: ReconnectBackoff) -> Self {
        let (push_tx, push_rx) = mpsc::channel();
        let mut engine = Self {
            owner_key: config.snapshot_owner(),
            refetch_delay: config.refetch_delay(),
            connection: ConnectionManager::new(backoff),
            registry: ActiveCallRegistry::new(config.operator_identity.as_deref()),
            subscriptions: SubscriptionCoordinator::new(),
            transcripts: TranscriptAggregator::new(),
            escalations: EscalationQueue::new(),
            availability: AvailabilityTracker::new(),
            push_tx,
            push_rx,
            poll_queue: VecDeque::new(),
            commands: VecDeque::new(),
            notifications: VecDeque::new(),
            installed: Vec::new(),
            monitor: None,
            link_up: false,
            refetch_scheduled: false,
        };
        engine.install_handlers();
        engine
    }

    fn install_handlers(&mut self) {
        for name in PUSH_EVENT_NAMES {
            let tx = self.push_tx.clone();
            let id = self.connection.on(
                name,
                Box::new(move |data: &Value| {
                    let _ = tx.send(PushInbound::Event {
                        name,
                        data: data.clone(),
                    });
                }),
            );
            self.installed.push((name, id));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn connect(&mut self, token: &str) -> Result<Dial> {
        let dial = self.connection.connect(token)?;
        self.pump();
        Ok(dial)
    }

    /// Reports a successful dial. Subscriptions are rebuilt from scratch on
    /// every new connection.
    pub fn connection_opened(&mut self, generation: u64, sink: Box<dyn FrameSink>) -> bool {
        if !self.connection.opened(generation, sink) {
            return false;
        }
        self.subscriptions.reset();
        self.reconcile();
        self.pump();
        true
    }

    pub fn dial_failed(&mut self, generation: u64, reason: &str) -> Option<ReconnectPlan> {
        self.connection.dial_failed(generation, reason)
    }

    pub fn connection_closed(&mut self, generation: u64, reason: &str) -> Option<ReconnectPlan> {
        let plan = self.connection.closed(generation, reason);
        self.pump();
        plan
    }

    pub fn reconnect_due(&mut self, generation: u64) -> Option<Dial> {
        self.connection.reconnect_due(generation)
    }

    /// Feeds one inbound text frame from the push channel.
    pub fn handle_frame(&mut self, text: &str) {
        self.connection.handle_text(text);
        self.pump();
    }

    /// Samples connection liveness. Called on the liveness timer so the
    /// visible indicator changes at a fixed cadence.
    pub fn sample_liveness(&mut self) -> bool {
        let connected = self.connection.is_connected();
        if connected != self.link_up {
            self.link_up = connected;
            self.notifications
                .push_back(Notification::LinkChanged { connected });
        }
        self.link_up
    }

    // ─────────────────────────────────────────────────────────────────────
    // Snapshot polling
    // ─────────────────────────────────────────────────────────────────────

    /// Poll timer tick.
    pub fn poll_due(&mut self) {
        self.commands.push_back(Command::FetchSnapshot {
            owner_key: self.owner_key.clone(),
            delay: Duration::ZERO,
        });
    }

    pub fn submit_snapshot(&mut self, outcome: SnapshotOutcome) {
        self.poll_queue.push_back(outcome);
        self.pump();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queue processing
    // ─────────────────────────────────────────────────────────────────────

    /// Drains the push queue, then the poll queue.
    pub fn pump(&mut self) {
        while let Ok(inbound) = self.push_rx.try_recv() {
            self.handle_push(inbound);
        }
        while let Some(outcome) = self.poll_queue.pop_front() {
            self.handle_snapshot(outcome);
            while let Ok(inbound) = self.push_rx.try_recv() {
                self.handle_push(inbound);
            }
        }
    }

    fn handle_push(&mut self, inbound: PushInbound) {
        match inbound {
            PushInbound::Event { name, data } => match parse_push_event(name, data) {
                Ok(event) => self.handle_event(event),
                Err(err) => warn!(event = name, error = %err, "Dropping invalid push payload"),
            },
            PushInbound::SubscribeAck {
                call_id,
                ticket,
                outcome,
            } => self.handle_subscribe_ack(&call_id, ticket, outcome),
        }
    }

    fn handle_event(&mut self, event: PushEvent) {
        let now = Utc::now();
        match event {
            PushEvent::CallStarted(started) => {
                let change = self.registry.call_started(&started, now);
                if !change.is_empty() {
                    self.apply_change(change);
                }
            }
            PushEvent::CallEnded(ended) => {
                let change = self.registry.call_ended(&ended.call_id);
                if !change.is_empty() {
                    self.apply_change(change);
                }
            }
            PushEvent::SttTranscript(fragment) => {
                if !self.accepts_fragments(&fragment.call_id) {
                    return;
                }
                let timestamp = fragment
                    .timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or(now);
                self.transcripts.on_fragment(TranscriptFragment {
                    call_id: fragment.call_id,
                    speaker: Speaker::Caller,
                    text: fragment.text,
                    timestamp,
                    is_final: fragment.is_final,
                });
            }
            PushEvent::TtsStarted(utterance) => {
                if !self.accepts_fragments(&utterance.call_id) {
                    return;
                }
                let timestamp = utterance
                    .timestamp
                    .as_deref()
                    .and_then(parse_timestamp)
                    .unwrap_or(now);
                self.transcripts
                    .assistant_started(&utterance.call_id, utterance.text, timestamp);
            }
            PushEvent::TtsCompleted(completed) => {
                self.transcripts.assistant_finished(&completed.call_id);
            }
            PushEvent::HitlRequested(requested) => {
                let request = EscalationRequest::from_event(requested, now);
                let call_id = request.call_id.clone();
                if self.escalations.enqueue(request) {
                    self.notifications
                        .push_back(Notification::EscalationOpened { call_id });
                }
            }
            PushEvent::HitlResolved(resolved) => {
                self.close_escalation(&resolved.call_id, EscalationClosure::ResolvedElsewhere);
            }
            PushEvent::HitlTimeout(timeout) => {
                self.close_escalation(&timeout.call_id, EscalationClosure::TimedOut);
            }
        }
    }

    fn accepts_fragments(&self, call_id: &str) -> bool {
        let held = self.subscriptions.is_held(call_id);
        if !held {
            debug!(call_id, "Dropping transcript fragment for unsubscribed call");
        }
        held
    }

    fn close_escalation(&mut self, call_id: &str, closure: EscalationClosure) {
        if self.escalations.close(call_id, closure).is_some() {
            self.notifications.push_back(Notification::EscalationClosed {
                call_id: call_id.to_string(),
                closure,
            });
        }
    }

    fn handle_snapshot(&mut self, outcome: SnapshotOutcome) {
        self.refetch_scheduled = false;
        let change = self.registry.apply_snapshot(outcome, Utc::now());
        self.apply_change(change);
    }

    fn apply_change(&mut self, change: RegistryChange) {
        for call_id in &change.removed {
            self.transcripts.discard(call_id);
            self.notifications.push_back(Notification::CallRemoved {
                call_id: call_id.clone(),
            });
        }
        for call_id in &change.added {
            self.notifications.push_back(Notification::CallAdded {
                call_id: call_id.clone(),
            });
        }
        self.reconcile();
        if change.emptied {
            self.close_inspection();
            self.notifications.push_back(Notification::RegistryEmptied);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribes only while the push channel is up; `connection_opened`
    /// reconciles again once it is.
    fn reconcile(&mut self) {
        let ids = self.registry.ids();
        let plan = if self.connection.is_connected() {
            self.subscriptions.reconcile(&ids)
        } else {
            self.subscriptions.release_departed(&ids)
        };
        for call_id in plan.unsubscribe {
            self.send_unsubscribe(&call_id);
            self.transcripts.discard(&call_id);
        }
        for (call_id, ticket) in plan.subscribe {
            let tx = self.push_tx.clone();
            let acked = call_id.clone();
            self.connection.send(
                REQUEST_SUBSCRIBE_CALL,
                SubscribeCall::new(&call_id).payload(),
                Some(Box::new(move |outcome: AckOutcome| {
                    let _ = tx.send(PushInbound::SubscribeAck {
                        call_id: acked,
                        ticket,
                        outcome,
                    });
                })),
            );
        }
    }

    fn send_unsubscribe(&mut self, call_id: &str) {
        debug!(call_id, "Unsubscribing from call");
        self.connection.send(
            REQUEST_UNSUBSCRIBE_CALL,
            UnsubscribeCall::new(call_id).payload(),
            None,
        );
    }

    fn handle_subscribe_ack(&mut self, call_id: &str, ticket: u64, outcome: AckOutcome) {
        match self.subscriptions.on_ack(call_id, ticket, outcome) {
            AckDisposition::Activated | AckDisposition::Ignored => {}
            AckDisposition::Failed {
                reason,
                stale_state,
            } => {
                self.notifications
                    .push_back(Notification::SubscriptionFailed {
                        call_id: call_id.to_string(),
                        reason,
                    });
                if stale_state {
                    self.schedule_refetch();
                }
            }
        }
    }

    fn schedule_refetch(&mut self) {
        if self.refetch_scheduled {
            return;
        }
        self.refetch_scheduled = true;
        debug!(
            delay_ms = self.refetch_delay.as_millis() as u64,
            "Scheduling snapshot re-fetch"
        );
        self.commands.push_back(Command::FetchSnapshot {
            owner_key: self.owner_key.clone(),
            delay: self.refetch_delay,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Escalations
    // ─────────────────────────────────────────────────────────────────────

    /// Answers an open escalation. On success the request is gone locally and
    /// the answer has been handed to the push channel once.
    pub fn resolve_escalation(&mut self, call_id: &str, resolution: Resolution) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(CallwatchError::NotConnected);
        }
        let submission = self.escalations.resolve(call_id, resolution)?;
        let payload = submission.to_payload()?;
        let answered = call_id.to_string();
        self.connection.send(
            REQUEST_SUBMIT_HITL_RESPONSE,
            payload,
            Some(Box::new(move |outcome: AckOutcome| match outcome {
                AckOutcome::Answered(data) => {
                    if data.get("success").and_then(Value::as_bool) == Some(false) {
                        warn!(call_id = %answered, response = %data, "Escalation answer rejected by backend");
                    }
                }
                AckOutcome::Failed(reason) => {
                    warn!(call_id = %answered, reason = %reason, "Escalation answer not acknowledged");
                }
            })),
        );
        self.notifications.push_back(Notification::EscalationClosed {
            call_id: call_id.to_string(),
            closure: EscalationClosure::Answered,
        });
        self.pump();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Availability
    // ─────────────────────────────────────────────────────────────────────

    pub fn refresh_availability(&mut self) {
        let round_trip = self.availability.begin_fetch();
        self.commands
            .push_back(Command::FetchAvailability { round_trip });
    }

    pub fn set_availability(
        &mut self,
        status: OperatorStatus,
        away_message: Option<String>,
    ) -> Result<()> {
        let update = self.availability.request_change(status, away_message)?;
        info!(status = status.as_str(), "Operator availability change requested");
        self.commands.push_back(Command::UpdateAvailability(update));
        Ok(())
    }

    /// Answer to a [`Command::FetchAvailability`]. Returns `false` when the
    /// answer was older than the state already shown and got dropped.
    pub fn availability_fetched(
        &mut self,
        round_trip: u64,
        response: OperatorStatusResponse,
    ) -> bool {
        let status = response.status;
        if !self.availability.confirm_fetch(round_trip, response) {
            return false;
        }
        self.notifications
            .push_back(Notification::AvailabilityConfirmed { status });
        true
    }

    /// Echo of a [`Command::UpdateAvailability`].
    pub fn availability_updated(&mut self, response: OperatorStatusResponse) {
        let status = response.status;
        self.availability.confirm_update(response);
        self.notifications
            .push_back(Notification::AvailabilityConfirmed { status });
    }

    /// Failure of a [`Command::UpdateAvailability`]. Returns the error to
    /// surface to whoever initiated the request.
    pub fn availability_failed(&mut self, reason: impl Into<String>) -> CallwatchError {
        self.availability.reject(reason)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    /// Opens a live view onto `call_id`, replacing any current one.
    pub fn inspect<F>(&mut self, call_id: &str, on_event: F) -> Result<()>
    where
        F: FnMut(&PushEvent) + Send + 'static,
    {
        if !self.registry.contains(call_id) {
            return Err(CallwatchError::CallNotFound(call_id.to_string()));
        }
        self.close_inspection();
        self.monitor = Some(CallMonitor::attach(
            &mut self.connection,
            call_id,
            Box::new(on_event),
        ));
        Ok(())
    }

    pub fn close_inspection(&mut self) -> Option<String> {
        let monitor = self.monitor.take()?;
        let call_id = monitor.detach(&mut self.connection);
        self.notifications.push_back(Notification::InspectionClosed {
            call_id: call_id.clone(),
        });
        Some(call_id)
    }

    pub fn inspected_call(&self) -> Option<&str> {
        self.monitor.as_ref().map(CallMonitor::call_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Deregisters every handler, unsubscribes every held call and
    /// disconnects. The engine is inert afterwards.
    pub fn teardown(&mut self) {
        self.close_inspection();
        for (event, id) in self.installed.drain(..) {
            self.connection.off(event, id);
        }
        let released = self.subscriptions.release_all();
        for call_id in &released {
            self.send_unsubscribe(call_id);
            self.transcripts.discard(call_id);
        }
        self.connection.disconnect();
        while self.push_rx.try_recv().is_ok() {}
        self.poll_queue.clear();
        self.commands.clear();
        info!(unsubscribed = released.len(), "Monitor torn down");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outputs and projections
    // ─────────────────────────────────────────────────────────────────────

    pub fn take_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    pub fn calls(&self) -> &[CallSession] {
        self.registry.calls()
    }

    pub fn call(&self, call_id: &str) -> Option<&CallSession> {
        self.registry.get(call_id)
    }

    pub fn is_source_unavailable(&self) -> bool {
        self.registry.is_source_unavailable()
    }

    pub fn subscription_phase(&self, call_id: &str) -> SubscriptionPhase {
        self.subscriptions.phase(call_id)
    }

    pub fn transcript(&self, call_id: &str) -> Option<&CallTranscript> {
        self.transcripts.transcript(call_id)
    }

    pub fn escalations(&self) -> impl Iterator<Item = &EscalationRequest> {
        self.escalations.iter()
    }

    pub fn escalation(&self, call_id: &str) -> Option<&EscalationRequest> {
        self.escalations.get(call_id)
    }

    pub fn escalation_count(&self) -> usize {
        self.escalations.len()
    }

    pub fn availability(&self) -> &AvailabilityState {
        self.availability.state()
    }

    pub fn pending_availability(&self) -> Option<&OperatorStatusUpdate> {
        self.availability.pending()
    }

    /// Last sampled liveness; see [`MonitorEngine::sample_liveness`].
    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn connection_phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    pub fn connection_generation(&self) -> u64 {
        self.connection.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwatch_protocol::{decode_packet, Packet};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Packet>>>,
    }

    impl FrameSink for Recorder {
        fn send_text(&mut self, text: String) -> std::result::Result<(), String> {
            let packet = decode_packet(&text).map_err(|err| err.to_string())?;
            self.frames.lock().unwrap().push(packet);
            Ok(())
        }
    }

    fn engine() -> (MonitorEngine, Recorder) {
        let config = MonitorConfig {
            operator_identity: Some("sip:1002@pbx.local".to_string()),
            ..MonitorConfig::default()
        };
        let mut engine = MonitorEngine::with_backoff(
            &config,
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(80))
                .without_jitter(),
        );
        let recorder = Recorder::default();
        let dial = engine.connect("aaa.bbb.ccc").expect("dial");
        assert!(engine.connection_opened(dial.generation, Box::new(recorder.clone())));
        (engine, recorder)
    }

    #[test]
    fn installs_one_handler_per_push_event() {
        let (engine, _) = engine();
        assert_eq!(engine.installed.len(), PUSH_EVENT_NAMES.len());
    }

    #[test]
    fn poll_tick_emits_fetch_command() {
        let (mut engine, _) = engine();
        engine.poll_due();
        assert_eq!(
            engine.take_commands(),
            vec![Command::FetchSnapshot {
                owner_key: "sip:1002@pbx.local".to_string(),
                delay: Duration::ZERO,
            }]
        );
        assert!(engine.take_commands().is_empty());
    }

    #[test]
    fn liveness_is_sampled_not_pushed() {
        let (mut engine, _) = engine();
        assert!(!engine.is_link_up());
        assert!(engine.sample_liveness());
        assert_eq!(
            engine.take_notifications(),
            vec![Notification::LinkChanged { connected: true }]
        );
        assert!(engine.sample_liveness());
        assert!(engine.take_notifications().is_empty());
    }

    #[test]
    fn resolve_requires_connection() {
        let mut engine = MonitorEngine::new(&MonitorConfig::default());
        let err = engine
            .resolve_escalation("c3", Resolution::answer("ok"))
            .unwrap_err();
        assert!(matches!(err, CallwatchError::NotConnected));
    }
}
