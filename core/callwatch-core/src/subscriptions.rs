//! Per-call subscription state.
//!
//! The coordinator decides; the engine sends. [`SubscriptionCoordinator::reconcile`]
//! marks newly present calls `Pending` and hands back the subscribe and
//! unsubscribe requests to issue. Acks come back tagged with the ticket the
//! `Pending` entry was created with, so an ack for an older request is
//! recognised and ignored.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use callwatch_protocol::CallAck;

use crate::connection::AckOutcome;

/// Failure reasons that suggest the local registry is stale.
const STALE_STATE_MARKERS: [&str; 4] = ["not found", "unknown", "forbidden", "not authorized"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPhase {
    None,
    Pending,
    Active,
    Failed { reason: String },
}

impl SubscriptionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPhase::None => "none",
            SubscriptionPhase::Pending => "pending",
            SubscriptionPhase::Active => "active",
            SubscriptionPhase::Failed { .. } => "failed",
        }
    }

    /// Pending or active: the server holds (or is about to hold) a subscription.
    pub fn is_held(&self) -> bool {
        matches!(self, SubscriptionPhase::Pending | SubscriptionPhase::Active)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    phase: SubscriptionPhase,
    ticket: u64,
}

/// Requests produced by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// `(call_id, ticket)` pairs now marked pending.
    pub subscribe: Vec<(String, u64)>,
    pub unsubscribe: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// What an ack did to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDisposition {
    Activated,
    Failed {
        reason: String,
        /// The reason points at stale local state; a delayed re-fetch is due.
        stale_state: bool,
    },
    /// No pending entry with that ticket.
    Ignored,
}

#[derive(Debug, Default)]
pub struct SubscriptionCoordinator {
    entries: HashMap<String, Entry>,
    next_ticket: u64,
}

impl SubscriptionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, call_id: &str) -> SubscriptionPhase {
        self.entries
            .get(call_id)
            .map(|entry| entry.phase.clone())
            .unwrap_or(SubscriptionPhase::None)
    }

    pub fn is_held(&self, call_id: &str) -> bool {
        self.entries
            .get(call_id)
            .is_some_and(|entry| entry.phase.is_held())
    }

    pub fn held_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.phase.is_held())
            .count()
    }

    /// Aligns subscriptions with the current registry ids.
    pub fn reconcile(&mut self, current: &[String]) -> ReconcilePlan {
        let mut plan = self.release_departed(current);

        let mut queued = HashSet::new();
        for call_id in current {
            if self.is_held(call_id) || !queued.insert(call_id.as_str()) {
                continue;
            }
            self.next_ticket += 1;
            let ticket = self.next_ticket;
            self.entries.insert(
                call_id.clone(),
                Entry {
                    phase: SubscriptionPhase::Pending,
                    ticket,
                },
            );
            plan.subscribe.push((call_id.clone(), ticket));
        }

        if !plan.is_empty() {
            debug!(
                subscribe = plan.subscribe.len(),
                unsubscribe = plan.unsubscribe.len(),
                "Subscription reconcile"
            );
        }
        plan
    }

    /// Drops entries for calls no longer in `current` without subscribing
    /// to new ones. Calls never seen stay at `None`.
    pub fn release_departed(&mut self, current: &[String]) -> ReconcilePlan {
        let present: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut plan = ReconcilePlan::default();

        let mut departed: Vec<String> = self
            .entries
            .keys()
            .filter(|call_id| !present.contains(call_id.as_str()))
            .cloned()
            .collect();
        departed.sort();
        for call_id in departed {
            if let Some(entry) = self.entries.remove(&call_id) {
                if entry.phase.is_held() {
                    plan.unsubscribe.push(call_id);
                }
            }
        }
        plan
    }

    /// Applies the answer to the subscribe issued with `ticket`.
    pub fn on_ack(&mut self, call_id: &str, ticket: u64, outcome: AckOutcome) -> AckDisposition {
        let Some(entry) = self.entries.get_mut(call_id) else {
            debug!(call_id, ticket, "Ack for a call no longer tracked");
            return AckDisposition::Ignored;
        };
        if entry.ticket != ticket || entry.phase != SubscriptionPhase::Pending {
            debug!(call_id, ticket, current = entry.ticket, "Stale subscribe ack ignored");
            return AckDisposition::Ignored;
        }

        let failure = match outcome {
            AckOutcome::Answered(data) => {
                let ack = CallAck::from_data(data);
                match (ack.success, ack.call_id.as_deref()) {
                    (true, Some(acked)) if acked == call_id => None,
                    (true, other) => Some(format!(
                        "subscribe ack named {} instead of {}",
                        other.unwrap_or("no call"),
                        call_id
                    )),
                    (false, _) => Some(
                        ack.error
                            .unwrap_or_else(|| "subscribe rejected".to_string()),
                    ),
                }
            }
            AckOutcome::Failed(reason) => Some(reason),
        };

        match failure {
            None => {
                entry.phase = SubscriptionPhase::Active;
                info!(call_id, "Subscribed to call");
                AckDisposition::Activated
            }
            Some(reason) => {
                let stale_state = is_stale_state_reason(&reason);
                warn!(call_id, reason = %reason, stale_state, "Subscribe failed");
                entry.phase = SubscriptionPhase::Failed {
                    reason: reason.clone(),
                };
                AckDisposition::Failed {
                    reason,
                    stale_state,
                }
            }
        }
    }

    /// Forgets every entry. Used when a new connection starts, since
    /// server-side subscriptions do not survive it.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Forgets every entry and returns the calls that still need an
    /// unsubscribe, sorted.
    pub fn release_all(&mut self) -> Vec<String> {
        let mut held: Vec<String> = self
            .entries
            .drain()
            .filter(|(_, entry)| entry.phase.is_held())
            .map(|(call_id, _)| call_id)
            .collect();
        held.sort();
        held
    }
}

pub fn is_stale_state_reason(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    STALE_STATE_MARKERS
        .iter()
        .any(|marker| reason.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn ok_ack(call_id: &str) -> AckOutcome {
        AckOutcome::Answered(json!({ "success": true, "call_id": call_id }))
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut coordinator = SubscriptionCoordinator::new();
        let first = coordinator.reconcile(&ids(&["c1", "c2"]));
        assert_eq!(first.subscribe.len(), 2);

        let second = coordinator.reconcile(&ids(&["c1", "c2"]));
        assert!(second.is_empty());
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::Pending);
    }

    #[test]
    fn duplicate_ids_in_input_subscribe_once() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1", "c1"]));
        assert_eq!(plan.subscribe.len(), 1);
    }

    #[test]
    fn active_only_after_matching_ack() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1"]));
        let (_, ticket) = plan.subscribe[0].clone();
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::Pending);

        let disposition = coordinator.on_ack("c1", ticket, ok_ack("c1"));
        assert_eq!(disposition, AckDisposition::Activated);
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::Active);
    }

    #[test]
    fn ack_naming_another_call_fails() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1"]));
        let disposition = coordinator.on_ack("c1", plan.subscribe[0].1, ok_ack("c7"));
        assert!(matches!(disposition, AckDisposition::Failed { stale_state: false, .. }));
        assert!(matches!(coordinator.phase("c1"), SubscriptionPhase::Failed { .. }));
    }

    #[test]
    fn failed_is_retried_on_next_reconcile() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1"]));
        coordinator.on_ack(
            "c1",
            plan.subscribe[0].1,
            AckOutcome::Answered(json!({ "success": false, "error": "rate limited" })),
        );
        assert_eq!(
            coordinator.phase("c1"),
            SubscriptionPhase::Failed {
                reason: "rate limited".to_string()
            }
        );

        let retry = coordinator.reconcile(&ids(&["c1"]));
        assert_eq!(retry.subscribe.len(), 1);
        assert!(retry.subscribe[0].1 > plan.subscribe[0].1);
    }

    #[test]
    fn stale_state_reasons_are_flagged() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1"]));
        let disposition = coordinator.on_ack(
            "c1",
            plan.subscribe[0].1,
            AckOutcome::Answered(json!({ "success": false, "error": "Call Not Found" })),
        );
        assert!(matches!(disposition, AckDisposition::Failed { stale_state: true, .. }));
        assert!(is_stale_state_reason("FORBIDDEN"));
        assert!(is_stale_state_reason("operator not authorized"));
        assert!(!is_stale_state_reason("timeout"));
    }

    #[test]
    fn removal_unsubscribes_only_held_calls() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1", "c2"]));
        let ticket_c2 = plan
            .subscribe
            .iter()
            .find(|(call_id, _)| call_id == "c2")
            .map(|(_, ticket)| *ticket)
            .unwrap();
        coordinator.on_ack("c2", ticket_c2, AckOutcome::Failed("closed".to_string()));

        let plan = coordinator.reconcile(&[]);
        assert_eq!(plan.unsubscribe, vec!["c1"]);
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::None);
        assert_eq!(coordinator.phase("c2"), SubscriptionPhase::None);
    }

    #[test]
    fn ack_for_earlier_request_is_ignored() {
        let mut coordinator = SubscriptionCoordinator::new();
        let first = coordinator.reconcile(&ids(&["c1"]));
        coordinator.reconcile(&[]);
        let second = coordinator.reconcile(&ids(&["c1"]));

        let stale = coordinator.on_ack("c1", first.subscribe[0].1, ok_ack("c1"));
        assert_eq!(stale, AckDisposition::Ignored);
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::Pending);

        let fresh = coordinator.on_ack("c1", second.subscribe[0].1, ok_ack("c1"));
        assert_eq!(fresh, AckDisposition::Activated);
    }

    #[test]
    fn ack_after_removal_is_ignored() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c1"]));
        coordinator.reconcile(&[]);
        let disposition = coordinator.on_ack("c1", plan.subscribe[0].1, ok_ack("c1"));
        assert_eq!(disposition, AckDisposition::Ignored);
        assert_eq!(coordinator.phase("c1"), SubscriptionPhase::None);
    }

    #[test]
    fn release_departed_never_subscribes() {
        let mut coordinator = SubscriptionCoordinator::new();
        coordinator.reconcile(&ids(&["c1"]));

        let plan = coordinator.release_departed(&ids(&["c2"]));
        assert_eq!(plan.unsubscribe, vec!["c1"]);
        assert!(plan.subscribe.is_empty());
        assert_eq!(coordinator.phase("c2"), SubscriptionPhase::None);

        let plan = coordinator.reconcile(&ids(&["c2"]));
        assert_eq!(plan.subscribe.len(), 1);
    }

    #[test]
    fn release_all_returns_held_calls() {
        let mut coordinator = SubscriptionCoordinator::new();
        let plan = coordinator.reconcile(&ids(&["c2", "c1", "c3"]));
        let ticket_c3 = plan.subscribe[2].1;
        coordinator.on_ack("c3", ticket_c3, AckOutcome::Failed("closed".to_string()));

        assert_eq!(coordinator.release_all(), vec!["c1", "c2"]);
        assert_eq!(coordinator.held_count(), 0);
    }
}
