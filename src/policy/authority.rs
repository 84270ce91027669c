use std::collections::HashMap;

use crate::calendar::Calendar;
use crate::domain::delegation::Delegation;
use crate::domain::graph::GraphModel;
use crate::domain::reservation::Reservation;
use crate::error::Error;
use crate::id::DelegationId;

/// Authority-side policy: redeem verification and local holdings recompute
/// (spec §4.5). Provisioning-pool dispatch and handler invocation live in
/// the kernel, which owns the async boundary; this policy only decides
/// whether a redeem may proceed.
pub struct AuthorityPolicy {
    oversubscription_factor: f64,
}

impl AuthorityPolicy {
    pub fn new(oversubscription_factor: f64) -> Self {
        AuthorityPolicy { oversubscription_factor }
    }

    /// Steps 1-3 of spec §4.5: verify ownership, recompute availability from
    /// ARM delegations minus local active holdings, and — if it still fits —
    /// commit the holding and enqueue into the `Redeeming` bucket.
    pub fn redeem(&self, arm: &GraphModel, calendar: &mut Calendar, delegations: &HashMap<DelegationId, Delegation>, reservation: &mut Reservation) -> Result<(), Error> {
        let node_map = reservation.node_map.ok_or_else(|| Error::InvalidRequest("redeem requires a node_map set by the broker".to_string()))?;

        let node = arm.get(node_map.graph_node_id).ok_or_else(|| Error::InvalidRequest("redeem references a node this authority does not own".to_string()))?;
        if node.site != reservation.site {
            return Err(Error::InvalidRequest("node_map does not belong to this authority's ARM".to_string()));
        }

        let committed = calendar.committed_over_excluding(node.id, reservation.lease_start, reservation.lease_end, reservation.id);
        let delegated = delegations.values().fold(crate::domain::reservation::Capacities::default(), |acc, d| acc.saturating_add(&d.delegated_capacity(node.id)));
        let limit = crate::domain::reservation::Capacities {
            cores: (delegated.cores as f64 * self.oversubscription_factor) as u32,
            ram_gb: (delegated.ram_gb as f64 * self.oversubscription_factor) as u32,
            disk_gb: (delegated.disk_gb as f64 * self.oversubscription_factor) as u32,
            bandwidth_gbps: (delegated.bandwidth_gbps as f64 * self.oversubscription_factor) as u32,
        };
        let available = limit.saturating_sub(&committed);

        if !reservation.approved.le(&available) {
            return Err(Error::InsufficientResources("late conflict: approved terms no longer fit local holdings".to_string()));
        }

        // Idempotent under retry: a redeem replayed after its own holding and
        // redeeming-bucket entry already landed must not double-commit either.
        if !calendar.has_holding(node.id, reservation.id) {
            calendar.add_holding(node.id, reservation.id, reservation.lease_start, reservation.lease_end, reservation.approved);
        }
        calendar.remove_redeeming(reservation.id);
        calendar.add_redeeming(reservation.id, reservation.lease_start);
        reservation.on_redeem_bound()
    }

    /// Extends an already-redeemed reservation's lease end in place (spec
    /// §4.5 renewal path): re-validates against the new window excluding the
    /// reservation's own current holding, then swaps the holding and lease
    /// end together so the calendar never observes a gap.
    pub fn extend(
        &self,
        arm: &GraphModel,
        calendar: &mut Calendar,
        delegations: &HashMap<DelegationId, Delegation>,
        reservation: &mut Reservation,
        new_lease_end: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), Error> {
        let node_map = reservation.node_map.ok_or_else(|| Error::InvalidRequest("extend requires an existing node_map".to_string()))?;
        let node = arm.get(node_map.graph_node_id).ok_or_else(|| Error::InvalidRequest("extend references a node this authority does not own".to_string()))?;

        let committed = calendar.committed_over_excluding(node.id, reservation.lease_start, new_lease_end, reservation.id);
        let delegated = delegations.values().fold(crate::domain::reservation::Capacities::default(), |acc, d| acc.saturating_add(&d.delegated_capacity(node.id)));
        let limit = crate::domain::reservation::Capacities {
            cores: (delegated.cores as f64 * self.oversubscription_factor) as u32,
            ram_gb: (delegated.ram_gb as f64 * self.oversubscription_factor) as u32,
            disk_gb: (delegated.disk_gb as f64 * self.oversubscription_factor) as u32,
            bandwidth_gbps: (delegated.bandwidth_gbps as f64 * self.oversubscription_factor) as u32,
        };
        let available = limit.saturating_sub(&committed);

        if !reservation.approved.le(&available) {
            return Err(Error::InsufficientResources("late conflict on extended lease window".to_string()));
        }

        calendar.remove_holding(node.id, reservation.id);
        calendar.add_holding(node.id, reservation.id, reservation.lease_start, new_lease_end, reservation.approved);
        reservation.lease_end = new_lease_end;
        reservation.on_lease_swapped()
    }
}
