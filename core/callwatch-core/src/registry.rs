//! Active-call registry and its merge policy.
//!
//! Two feeds update the registry: the periodic snapshot fetch and the
//! `call_started` / `call_ended` pushes. The snapshot source can lag a push,
//! so the merge rules are:
//!
//! - an empty snapshot never clears the registry (no change observed);
//! - a non-empty snapshot replaces the registry wholesale;
//! - a 503 snapshot is authoritative and forces the registry empty, and the
//!   registry stays empty (pushes included) until the next 200;
//! - any other fetch failure leaves the registry untouched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use callwatch_protocol::{ActiveCallRecord, CallStarted};

use crate::patterns::display_identity;
use crate::types::CallSession;

/// Result of one snapshot fetch, as the driver observed it.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    /// 200 with a (possibly empty) payload.
    Calls(Vec<ActiveCallRecord>),
    /// 503: the snapshot source is known absent.
    Unavailable,
    /// Network error, 401, or anything else.
    Failed(String),
}

/// What a registry mutation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// The registry went from non-empty to empty.
    pub emptied: bool,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActiveCallRegistry {
    calls: Vec<CallSession>,
    operator_identity: Option<String>,
    source_unavailable: bool,
}

impl ActiveCallRegistry {
    /// `operator_identity` scopes `call_started`; `None` accepts every call.
    pub fn new(operator_identity: Option<&str>) -> Self {
        Self {
            calls: Vec::new(),
            operator_identity: operator_identity
                .map(display_identity)
                .filter(|identity| !identity.is_empty()),
            source_unavailable: false,
        }
    }

    pub fn calls(&self) -> &[CallSession] {
        &self.calls
    }

    pub fn get(&self, call_id: &str) -> Option<&CallSession> {
        self.calls.iter().find(|call| call.id == call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.get(call_id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.calls.iter().map(|call| call.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn is_source_unavailable(&self) -> bool {
        self.source_unavailable
    }

    /// Whether a call to `callee_uri` belongs to this operator.
    pub fn is_for_operator(&self, callee_uri: &str) -> bool {
        match &self.operator_identity {
            Some(identity) => display_identity(callee_uri) == *identity,
            None => true,
        }
    }

    pub fn apply_snapshot(&mut self, outcome: SnapshotOutcome, now: DateTime<Utc>) -> RegistryChange {
        match outcome {
            SnapshotOutcome::Calls(records) => {
                if self.source_unavailable {
                    info!("Active-call source is back");
                }
                self.source_unavailable = false;
                if records.is_empty() {
                    debug!(
                        held = self.calls.len(),
                        "Empty snapshot; keeping registry as is"
                    );
                    return RegistryChange::default();
                }
                self.replace(records, now)
            }
            SnapshotOutcome::Unavailable => {
                if !self.source_unavailable {
                    warn!(
                        held = self.calls.len(),
                        "Active-call source unavailable; clearing registry"
                    );
                }
                self.source_unavailable = true;
                self.clear()
            }
            SnapshotOutcome::Failed(reason) => {
                warn!(error = %reason, "Snapshot fetch failed; registry left untouched");
                RegistryChange::default()
            }
        }
    }

    /// Idempotent insert from a `call_started` push.
    pub fn call_started(&mut self, event: &CallStarted, now: DateTime<Utc>) -> RegistryChange {
        if !self.is_for_operator(&event.callee_uri) {
            debug!(call_id = %event.call_id, callee = %event.callee_uri, "Ignoring call for another operator");
            return RegistryChange::default();
        }
        if self.source_unavailable {
            debug!(call_id = %event.call_id, "Ignoring call_started while source is unavailable");
            return RegistryChange::default();
        }
        if let Some(existing) = self.get(&event.call_id) {
            if existing.caller_uri != event.caller_uri || existing.ai_handled != event.is_ai_handled {
                debug!(call_id = %event.call_id, "Duplicate call_started with a different payload dropped");
            }
            return RegistryChange::default();
        }

        self.calls.push(CallSession::from_started(event, now));
        info!(call_id = %event.call_id, "Call started");
        RegistryChange {
            added: vec![event.call_id.clone()],
            removed: Vec::new(),
            emptied: false,
        }
    }

    pub fn call_ended(&mut self, call_id: &str) -> RegistryChange {
        let before = self.calls.len();
        self.calls.retain(|call| call.id != call_id);
        if self.calls.len() == before {
            debug!(call_id, "call_ended for an untracked call");
            return RegistryChange::default();
        }
        info!(call_id, "Call ended");
        RegistryChange {
            added: Vec::new(),
            removed: vec![call_id.to_string()],
            emptied: self.calls.is_empty(),
        }
    }

    fn replace(&mut self, records: Vec<ActiveCallRecord>, now: DateTime<Utc>) -> RegistryChange {
        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.call_id.clone()) {
                debug!(call_id = %record.call_id, "Duplicate id in snapshot dropped");
                continue;
            }
            let mut session = CallSession::from_record(record, now);
            if let Some(existing) = self.get(&record.call_id) {
                session.started_at = session.started_at.min(existing.started_at);
            }
            next.push(session);
        }

        let added = next
            .iter()
            .filter(|call| !self.contains(&call.id))
            .map(|call| call.id.clone())
            .collect::<Vec<_>>();
        let removed = self
            .calls
            .iter()
            .filter(|call| !seen.contains(&call.id))
            .map(|call| call.id.clone())
            .collect::<Vec<_>>();

        if !added.is_empty() || !removed.is_empty() {
            info!(
                calls = next.len(),
                added = added.len(),
                removed = removed.len(),
                "Registry replaced from snapshot"
            );
        }
        self.calls = next;
        RegistryChange {
            added,
            removed,
            emptied: false,
        }
    }

    fn clear(&mut self) -> RegistryChange {
        let removed = self.ids();
        let emptied = !removed.is_empty();
        self.calls.clear();
        RegistryChange {
            added: Vec::new(),
            removed,
            emptied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwatch_protocol::Participant;
    use chrono::TimeZone;

    const OPERATOR: &str = "sip:1002@pbx.local";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_000_000 + secs, 0).unwrap()
    }

    fn record(id: &str, duration: u64) -> ActiveCallRecord {
        ActiveCallRecord {
            call_id: id.to_string(),
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
            duration,
            current_question: None,
            ai_confidence: None,
            needs_hitl: None,
        }
    }

    fn started(id: &str, callee: &str) -> CallStarted {
        CallStarted {
            call_id: id.to_string(),
            caller_uri: "sip:1001@pbx.local".to_string(),
            callee_uri: callee.to_string(),
            is_ai_handled: true,
            timestamp: None,
        }
    }

    fn registry() -> ActiveCallRegistry {
        ActiveCallRegistry::new(Some(OPERATOR))
    }

    #[test]
    fn empty_snapshot_does_not_clear() {
        let mut registry = registry();
        registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c1", 0)]), at(0));
        let change = registry.apply_snapshot(SnapshotOutcome::Calls(Vec::new()), at(3));
        assert!(change.is_empty());
        assert_eq!(registry.ids(), vec!["c1"]);
    }

    #[test]
    fn non_empty_snapshot_replaces_wholesale() {
        let mut registry = registry();
        registry.apply_snapshot(
            SnapshotOutcome::Calls(vec![record("c1", 0), record("c2", 0)]),
            at(0),
        );
        let change =
            registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c3", 0)]), at(3));
        assert_eq!(change.added, vec!["c3"]);
        assert_eq!(change.removed, vec!["c1", "c2"]);
        assert!(!change.emptied);
        assert_eq!(registry.ids(), vec!["c3"]);
    }

    #[test]
    fn duplicate_snapshot_ids_collapse_to_first() {
        let mut registry = registry();
        registry.apply_snapshot(
            SnapshotOutcome::Calls(vec![record("c1", 10), record("c1", 99)]),
            at(100),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("c1").unwrap().duration_secs(at(100)), 10);
    }

    #[test]
    fn replacement_keeps_earliest_start() {
        let mut registry = registry();
        registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c1", 30)]), at(100));
        registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c1", 0)]), at(110));
        assert_eq!(registry.get("c1").unwrap().duration_secs(at(110)), 40);
    }

    #[test]
    fn unavailable_forces_empty_until_next_success() {
        let mut registry = registry();
        registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c1", 0)]), at(0));

        let change = registry.apply_snapshot(SnapshotOutcome::Unavailable, at(3));
        assert_eq!(change.removed, vec!["c1"]);
        assert!(change.emptied);
        assert!(registry.is_source_unavailable());

        let change = registry.call_started(&started("c2", OPERATOR), at(4));
        assert!(change.is_empty());
        assert!(registry.is_empty());

        registry.apply_snapshot(SnapshotOutcome::Calls(Vec::new()), at(6));
        assert!(!registry.is_source_unavailable());
        registry.call_started(&started("c2", OPERATOR), at(7));
        assert_eq!(registry.ids(), vec!["c2"]);
    }

    #[test]
    fn repeated_unavailable_reports_no_change() {
        let mut registry = registry();
        registry.apply_snapshot(SnapshotOutcome::Unavailable, at(0));
        let change = registry.apply_snapshot(SnapshotOutcome::Unavailable, at(3));
        assert!(change.is_empty());
        assert!(!change.emptied);
    }

    #[test]
    fn failed_fetch_leaves_registry_untouched() {
        let mut registry = registry();
        registry.apply_snapshot(SnapshotOutcome::Calls(vec![record("c1", 0)]), at(0));
        let change =
            registry.apply_snapshot(SnapshotOutcome::Failed("401 Unauthorized".into()), at(3));
        assert!(change.is_empty());
        assert_eq!(registry.ids(), vec!["c1"]);
        assert!(!registry.is_source_unavailable());
    }

    #[test]
    fn call_started_is_idempotent_and_scoped() {
        let mut registry = registry();
        let change = registry.call_started(&started("c1", OPERATOR), at(0));
        assert_eq!(change.added, vec!["c1"]);

        let change = registry.call_started(&started("c1", OPERATOR), at(1));
        assert!(change.is_empty());

        let change = registry.call_started(&started("c9", "sip:2001@pbx.local"), at(1));
        assert!(change.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn scoping_compares_user_parts() {
        let registry = ActiveCallRegistry::new(Some("1002"));
        assert!(registry.is_for_operator("sip:1002@other.host"));
        assert!(!registry.is_for_operator("sip:1003@pbx.local"));
        assert!(ActiveCallRegistry::new(None).is_for_operator("sip:9999@x"));
    }

    #[test]
    fn call_ended_reports_emptied() {
        let mut registry = registry();
        registry.call_started(&started("c1", OPERATOR), at(0));
        assert!(registry.call_ended("missing").is_empty());

        let change = registry.call_ended("c1");
        assert_eq!(change.removed, vec!["c1"]);
        assert!(change.emptied);
    }
}
