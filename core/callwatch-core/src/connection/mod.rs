//! Push-channel connection manager.
//!
//! The manager owns no socket. It tracks the connection state machine, the
//! handler table and outstanding acks, and tells the driver what to do next:
//! [`ConnectionManager::connect`] returns a [`Dial`], the driver reports the
//! outcome back (`opened`, `dial_failed`, `closed`) and feeds inbound text
//! frames to [`ConnectionManager::handle_text`]. Outbound frames leave
//! through the [`FrameSink`] handed over on `opened`.
//!
//! Frames are Socket.IO packets. The driver owns the Engine.IO session
//! (open, namespace connect, ping/pong) and only reports `opened` once the
//! server has accepted the namespace connect; the manager deals in event
//! and ack packets.
//!
//! Every reconnect plan and dial carries the generation it was issued for.
//! A deliberate [`ConnectionManager::disconnect`] bumps the generation, which
//! turns any timer or in-flight dial from before it into a no-op.

mod backoff;
mod token;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use callwatch_protocol::{decode_packet, Packet};

use crate::error::{CallwatchError, Result};

pub use backoff::ReconnectBackoff;
pub use token::is_token_shaped;

pub type HandlerId = u64;
pub type EventHandler = Box<dyn FnMut(&Value) + Send>;
pub type AckCallback = Box<dyn FnOnce(AckOutcome) + Send>;

/// Outbound half of a live connection.
pub trait FrameSink: Send {
    fn send_text(&mut self, text: String) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
        }
    }
}

/// How an ack-bearing request ended. Delivered exactly once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The server answered; the body still has to be inspected for success.
    Answered(Value),
    /// The request never got an answer (send failure or connection loss).
    Failed(String),
}

/// Directive to open a transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub generation: u64,
    pub attempt: u32,
    pub token: String,
}

/// Directive to call [`ConnectionManager::reconnect_due`] after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub generation: u64,
    pub delay: Duration,
}

pub struct ConnectionManager {
    phase: ConnectionPhase,
    token: Option<String>,
    generation: u64,
    backoff: ReconnectBackoff,
    sink: Option<Box<dyn FrameSink>>,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    next_handler_id: HandlerId,
    pending_acks: HashMap<u64, AckCallback>,
    next_request_id: u64,
}

impl ConnectionManager {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            token: None,
            generation: 0,
            backoff,
            sink: None,
            handlers: HashMap::new(),
            next_handler_id: 1,
            pending_acks: HashMap::new(),
            next_request_id: 1,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Starts a fresh connection attempt, abandoning any current one.
    pub fn connect(&mut self, token: &str) -> Result<Dial> {
        if !is_token_shaped(token) {
            warn!("Refusing to connect with a malformed credential");
            return Err(CallwatchError::MalformedToken);
        }
        if self.phase != ConnectionPhase::Disconnected {
            self.drop_link("reconnecting with a new credential");
        }
        self.generation += 1;
        self.token = Some(token.trim().to_string());
        self.backoff.reset();
        Ok(self.begin_dial())
    }

    /// Reports a successful dial. Returns `false` for a stale generation, in
    /// which case the driver should close the transport it just opened.
    pub fn opened(&mut self, generation: u64, sink: Box<dyn FrameSink>) -> bool {
        if generation != self.generation || self.phase != ConnectionPhase::Connecting {
            debug!(
                generation,
                current = self.generation,
                "Ignoring open for stale dial"
            );
            return false;
        }
        self.phase = ConnectionPhase::Connected;
        self.sink = Some(sink);
        self.backoff.reset();
        info!(generation, "Push channel connected");
        true
    }

    pub fn dial_failed(&mut self, generation: u64, reason: &str) -> Option<ReconnectPlan> {
        if generation != self.generation || self.phase != ConnectionPhase::Connecting {
            return None;
        }
        warn!(generation, reason, "Push channel dial failed");
        self.phase = ConnectionPhase::Disconnected;
        Some(self.plan_reconnect())
    }

    /// Reports that a live connection dropped.
    pub fn closed(&mut self, generation: u64, reason: &str) -> Option<ReconnectPlan> {
        if generation != self.generation || self.phase != ConnectionPhase::Connected {
            return None;
        }
        warn!(generation, reason, "Push channel dropped");
        self.drop_link(reason);
        Some(self.plan_reconnect())
    }

    /// Fires when a [`ReconnectPlan`] timer elapses.
    pub fn reconnect_due(&mut self, generation: u64) -> Option<Dial> {
        if generation != self.generation || self.phase != ConnectionPhase::Disconnected {
            return None;
        }
        self.token.as_ref()?;
        Some(self.begin_dial())
    }

    /// Deliberate teardown. Cancels any scheduled reconnect.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        self.token = None;
        if self.phase != ConnectionPhase::Disconnected {
            info!("Push channel disconnected");
        }
        self.drop_link("disconnected");
    }

    pub fn on(&mut self, event: &str, handler: EventHandler) -> HandlerId {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn off(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, Vec::len)
    }

    /// Emits a client-originated frame. Returns whether the frame reached the
    /// transport. When `ack` is given it fires exactly once.
    pub fn send(&mut self, event: &str, payload: Value, ack: Option<AckCallback>) -> bool {
        let request_id = ack.as_ref().map(|_| {
            let id = self.next_request_id;
            self.next_request_id += 1;
            id
        });

        let Some(sink) = self.sink.as_mut() else {
            debug!(event, "Dropping send while disconnected");
            if let Some(ack) = ack {
                ack(AckOutcome::Failed("push channel not connected".to_string()));
            }
            return false;
        };

        let text = match Packet::event(event, payload, request_id).encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(event, error = %err, "Failed to encode outbound frame");
                if let Some(ack) = ack {
                    ack(AckOutcome::Failed(err.message));
                }
                return false;
            }
        };

        if let Err(err) = sink.send_text(text) {
            warn!(event, error = %err, "Failed to write outbound frame");
            if let Some(ack) = ack {
                ack(AckOutcome::Failed(err));
            }
            return false;
        }

        if let (Some(id), Some(ack)) = (request_id, ack) {
            self.pending_acks.insert(id, ack);
        }
        true
    }

    /// Routes one inbound text frame to its ack callback or event handlers.
    pub fn handle_text(&mut self, text: &str) {
        match decode_packet(text) {
            Ok(Packet::Ack { id, data }) => match self.pending_acks.remove(&id) {
                Some(callback) => callback(AckOutcome::Answered(data)),
                None => debug!(ack = id, "Ack for unknown request"),
            },
            Ok(Packet::Event { name, data, .. }) => self.dispatch(&name, &data),
            Ok(other) => debug!(packet = other.kind(), "Ignoring control packet"),
            Err(err) => warn!(error = %err, "Dropping unreadable frame"),
        }
    }

    fn dispatch(&mut self, event: &str, data: &Value) {
        match self.handlers.get_mut(event) {
            Some(list) => {
                for (_, handler) in list.iter_mut() {
                    handler(data);
                }
            }
            None => debug!(event, "No handler for event"),
        }
    }

    fn begin_dial(&mut self) -> Dial {
        self.phase = ConnectionPhase::Connecting;
        Dial {
            generation: self.generation,
            attempt: self.backoff.failures() + 1,
            token: self.token.clone().unwrap_or_default(),
        }
    }

    fn plan_reconnect(&mut self) -> ReconnectPlan {
        let delay = self.backoff.next_delay();
        debug!(
            generation = self.generation,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        ReconnectPlan {
            generation: self.generation,
            delay,
        }
    }

    fn drop_link(&mut self, reason: &str) {
        self.phase = ConnectionPhase::Disconnected;
        self.sink = None;
        for (_, callback) in self.pending_acks.drain() {
            callback(AckOutcome::Failed(reason.to_string()));
        }
    }
}
