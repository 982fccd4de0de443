//! Operator availability.
//!
//! Local state is either the initial guess or the last authoritative echo.
//! Every successful round trip replaces it wholesale; no field is ever merged.
//!
//! Fetches and updates can overlap. Each round trip is numbered when it is
//! issued: a fetch answer older than the last applied answer is dropped, and
//! only the update answer clears the pending change.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use callwatch_protocol::{
    OperatorStatus, OperatorStatusResponse, OperatorStatusUpdate, DEFAULT_AWAY_MESSAGE,
};

use crate::error::{CallwatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAvailability {
    pub operator_id: Option<String>,
    pub status: OperatorStatus,
    pub away_message: String,
    pub changed_at: Option<DateTime<Utc>>,
    pub unresolved_escalations: u32,
}

impl Default for OperatorAvailability {
    fn default() -> Self {
        Self {
            operator_id: None,
            status: OperatorStatus::Offline,
            away_message: DEFAULT_AWAY_MESSAGE.to_string(),
            changed_at: None,
            unresolved_escalations: 0,
        }
    }
}

impl From<OperatorStatusResponse> for OperatorAvailability {
    fn from(response: OperatorStatusResponse) -> Self {
        Self {
            operator_id: Some(response.operator_id).filter(|id| !id.is_empty()),
            status: response.status,
            away_message: response.away_message,
            changed_at: Some(response.status_changed_at),
            unresolved_escalations: response.unresolved_hitl_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityState {
    /// Never confirmed by the backend.
    Unconfirmed(OperatorAvailability),
    /// Exactly what the backend last returned.
    Confirmed(OperatorAvailability),
}

impl Default for AvailabilityState {
    fn default() -> Self {
        AvailabilityState::Unconfirmed(OperatorAvailability::default())
    }
}

impl AvailabilityState {
    pub fn current(&self) -> &OperatorAvailability {
        match self {
            AvailabilityState::Unconfirmed(availability)
            | AvailabilityState::Confirmed(availability) => availability,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, AvailabilityState::Confirmed(_))
    }
}

#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    state: AvailabilityState,
    pending: Option<PendingChange>,
    last_round_trip: u64,
    applied_round_trip: u64,
}

#[derive(Debug)]
struct PendingChange {
    round_trip: u64,
    update: OperatorStatusUpdate,
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AvailabilityState {
        &self.state
    }

    pub fn current(&self) -> &OperatorAvailability {
        self.state.current()
    }

    /// The change awaiting its round trip, if any.
    pub fn pending(&self) -> Option<&OperatorStatusUpdate> {
        self.pending.as_ref().map(|pending| &pending.update)
    }

    /// Numbers a status fetch. Hand the number back to [`Self::confirm_fetch`].
    pub fn begin_fetch(&mut self) -> u64 {
        self.next_round_trip()
    }

    /// Builds the update request for `status`. An omitted or blank message
    /// carries the currently held one forward.
    pub fn request_change(
        &mut self,
        status: OperatorStatus,
        away_message: Option<String>,
    ) -> Result<OperatorStatusUpdate> {
        if self.pending.is_some() {
            return Err(CallwatchError::StatusChangeInFlight);
        }
        let away_message = away_message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| self.current().away_message.clone());
        let update = OperatorStatusUpdate {
            status,
            away_message: Some(away_message),
        };
        let round_trip = self.next_round_trip();
        self.pending = Some(PendingChange {
            round_trip,
            update: update.clone(),
        });
        Ok(update)
    }

    /// Applies the answer to fetch `round_trip` unless a newer answer has
    /// already been applied. A pending change stays pending either way.
    /// Returns whether the state was replaced.
    pub fn confirm_fetch(&mut self, round_trip: u64, response: OperatorStatusResponse) -> bool {
        if round_trip < self.applied_round_trip {
            debug!(
                round_trip,
                applied = self.applied_round_trip,
                "Dropping status fetch older than the applied state"
            );
            return false;
        }
        self.apply(round_trip, response);
        true
    }

    /// Applies the echo of the pending change and clears it.
    pub fn confirm_update(&mut self, response: OperatorStatusResponse) {
        let round_trip = match self.pending.take() {
            Some(pending) => pending.round_trip,
            None => {
                debug!("Status update echo with no change pending");
                self.applied_round_trip
            }
        };
        self.apply(round_trip, response);
    }

    /// Records a failed update. State is untouched; the returned error is
    /// for the caller that initiated the request.
    pub fn reject(&mut self, reason: impl Into<String>) -> CallwatchError {
        let reason = reason.into();
        warn!(reason = %reason, "Operator availability request failed");
        self.pending = None;
        CallwatchError::StatusRequestFailed(reason)
    }

    fn apply(&mut self, round_trip: u64, response: OperatorStatusResponse) {
        let availability = OperatorAvailability::from(response);
        info!(
            status = availability.status.as_str(),
            unresolved = availability.unresolved_escalations,
            "Operator availability confirmed"
        );
        self.applied_round_trip = self.applied_round_trip.max(round_trip);
        self.state = AvailabilityState::Confirmed(availability);
    }

    fn next_round_trip(&mut self) -> u64 {
        self.last_round_trip += 1;
        self.last_round_trip
    }
}
