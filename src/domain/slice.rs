use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{GraphNodeId, ReservationId, SliceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceState {
    Nascent,
    Configuring,
    StableOk,
    StableError,
    /// A modify (extend/resize) is in flight against an otherwise healthy slice.
    ModifyingOk,
    Closing,
    Dead,
}

impl SliceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SliceState::Dead)
    }
}

#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user: String,
    pub project: String,
}

/// A named, user-owned container for reservations. See spec §3 "Slice".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub id: SliceId,
    pub name: String,
    pub owner: Owner,
    pub state: SliceState,
    pub lease_start: DateTime<Utc>,
    pub lease_end: DateTime<Utc>,
    /// Id into the ASM/request-graph store this slice was built from.
    pub graph_id: Option<GraphNodeId>,
    pub reservation_ids: Vec<ReservationId>,
    pub last_update: DateTime<Utc>,
}

impl Slice {
    pub fn new(name: impl Into<String>, owner: Owner, lease_start: DateTime<Utc>, lease_end: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Slice {
            id: SliceId::new(),
            name: name.into(),
            owner,
            state: SliceState::Nascent,
            lease_start,
            lease_end,
            graph_id: None,
            reservation_ids: Vec::new(),
            last_update: now,
        }
    }

    pub fn add_reservation(&mut self, id: ReservationId) {
        self.reservation_ids.push(id);
    }

    /// Slices of the same owner may not share a name while either is
    /// non-terminal (spec §3 invariant).
    pub fn conflicts_with(&self, other_owner: &Owner, other_name: &str) -> bool {
        !self.state.is_terminal() && self.owner == *other_owner && self.name == other_name
    }

    /// Recomputes `StableOk`/`StableError`/`ModifyingOk`/`Dead` from the
    /// terminal/active/pending mix of its reservations, as spec §7 describes:
    /// "the slice enters `StableError` if any reservation is `Failed` while
    /// others are `Active`".
    pub fn recompute_state(&mut self, reservations: &[(super::ReservationState, super::PendingState)]) {
        use super::PendingState as PS;
        use super::ReservationState::*;
        if reservations.is_empty() {
            return;
        }
        let all_terminal = reservations.iter().all(|(s, _)| matches!(s, Closed | Failed));
        if all_terminal && matches!(self.state, SliceState::Closing) {
            self.state = SliceState::Dead;
            self.last_update = Utc::now();
            return;
        }
        if matches!(self.state, SliceState::Closing | SliceState::Dead) {
            return;
        }
        let any_failed = reservations.iter().any(|(s, _)| matches!(s, Failed));
        let any_active = reservations.iter().any(|(s, _)| matches!(s, Active | ActiveTicketed));
        let any_modifying = reservations.iter().any(|(_, p)| matches!(p, PS::ExtendingTicket | PS::ExtendingLease));
        self.state = if any_failed {
            SliceState::StableError
        } else if any_modifying && any_active {
            SliceState::ModifyingOk
        } else if reservations.iter().all(|(s, _)| matches!(s, Closed)) {
            SliceState::Dead
        } else if reservations.iter().all(|(s, _)| matches!(s, Active)) {
            SliceState::StableOk
        } else {
            SliceState::Configuring
        };
        self.last_update = Utc::now();
    }
}

impl PartialEq for Owner {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user && self.project == other.project
    }
}
impl Eq for Owner {}
