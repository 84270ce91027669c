use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::clock::Tick;
use crate::domain::reservation::Capacities;
use crate::id::{GraphNodeId, ReservationId};

/// A capacity/component commitment against one substrate graph node for one
/// reservation's lease window. Holdings are the hot-path query for
/// allocation (`holdings_at`).
#[derive(Debug, Clone)]
pub struct Holding {
    pub reservation_id: ReservationId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub capacities: Capacities,
}

/// A due-time ordered queue shared by the Pending/Redeeming/Renewing/Closing
/// buckets; generic over the key type since pending is keyed by tick while
/// the others are keyed by wall time (spec §4.3).
#[derive(Debug, Clone, Default)]
struct DueQueue<K: Ord + Copy> {
    by_due: BTreeMap<K, Vec<ReservationId>>,
}

impl<K: Ord + Copy> DueQueue<K> {
    fn add(&mut self, reservation_id: ReservationId, due: K) {
        self.by_due.entry(due).or_default().push(reservation_id);
    }

    fn remove(&mut self, reservation_id: ReservationId) {
        self.by_due.retain(|_, v| {
            v.retain(|id| *id != reservation_id);
            !v.is_empty()
        });
    }

    /// Removes and returns every entry whose due key is `<= cutoff`.
    fn take_due(&mut self, cutoff: K) -> Vec<ReservationId> {
        let due_keys: Vec<K> = self.by_due.range(..=cutoff).map(|(k, _)| *k).collect();
        let mut out = Vec::new();
        for k in due_keys {
            if let Some(v) = self.by_due.remove(&k) {
                out.extend(v);
            }
        }
        out
    }

    fn peek_due(&self, cutoff: K) -> Vec<ReservationId> {
        self.by_due.range(..=cutoff).flat_map(|(_, v)| v.iter().copied()).collect()
    }
}

/// Per-actor time/slice index of reservations used for allocation decisions
/// (spec §4.3). Each actor (orchestrator, broker, authority) owns exactly
/// one `Calendar`.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    pending: DueQueue<Tick>,
    redeeming: DueQueue<i64>,
    renewing: DueQueue<i64>,
    closing: DueQueue<i64>,
    holdings: HashMap<GraphNodeId, Vec<Holding>>,
}

fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

impl Calendar {
    pub fn new() -> Self {
        Calendar::default()
    }

    pub fn add_pending(&mut self, reservation_id: ReservationId, due: Tick) {
        self.pending.add(reservation_id, due);
    }

    pub fn remove_pending(&mut self, reservation_id: ReservationId) {
        self.pending.remove(reservation_id);
    }

    /// Reservations due for re-examination at or before `tick` (removed from
    /// the bucket; callers re-add if still not ready to progress).
    pub fn due_before(&mut self, tick: Tick) -> Vec<ReservationId> {
        self.pending.take_due(tick)
    }

    pub fn add_redeeming(&mut self, reservation_id: ReservationId, lease_start: DateTime<Utc>) {
        self.redeeming.add(reservation_id, ts(lease_start));
    }

    pub fn remove_redeeming(&mut self, reservation_id: ReservationId) {
        self.redeeming.remove(reservation_id);
    }

    /// Reservations whose lease-start has arrived and which have not yet had
    /// their handler invoked (spec §4.3 "Redeeming").
    pub fn redeeming_due(&mut self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.redeeming.take_due(ts(now))
    }

    pub fn add_renewing(&mut self, reservation_id: ReservationId, lease_end: DateTime<Utc>) {
        self.renewing.add(reservation_id, ts(lease_end));
    }

    pub fn remove_renewing(&mut self, reservation_id: ReservationId) {
        self.renewing.remove(reservation_id);
    }

    /// Reservations whose lease-end falls within `lookahead` of `now`
    /// (spec §4.3 "Renewing").
    pub fn renewal_candidates(&self, now: DateTime<Utc>, lookahead: chrono::Duration) -> Vec<ReservationId> {
        self.renewing.peek_due(ts(now + lookahead))
    }

    pub fn add_closing(&mut self, reservation_id: ReservationId, lease_end: DateTime<Utc>) {
        self.closing.add(reservation_id, ts(lease_end));
    }

    pub fn remove_closing(&mut self, reservation_id: ReservationId) {
        self.closing.remove(reservation_id);
    }

    /// Reservations at or past lease-end that still need teardown
    /// (spec §4.3 "Closing").
    pub fn closing_before(&mut self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.closing.take_due(ts(now))
    }

    /// Commits capacity for `reservation_id` on `node` for `[start, end)`.
    pub fn add_holding(&mut self, node: GraphNodeId, reservation_id: ReservationId, start: DateTime<Utc>, end: DateTime<Utc>, capacities: Capacities) {
        self.holdings.entry(node).or_default().push(Holding { reservation_id, start, end, capacities });
    }

    pub fn remove_holding(&mut self, node: GraphNodeId, reservation_id: ReservationId) {
        if let Some(list) = self.holdings.get_mut(&node) {
            list.retain(|h| h.reservation_id != reservation_id);
        }
    }

    pub fn remove_holding_anywhere(&mut self, reservation_id: ReservationId) {
        for list in self.holdings.values_mut() {
            list.retain(|h| h.reservation_id != reservation_id);
        }
    }

    /// All non-terminal holdings on `node` whose `[start,end)` covers `t`
    /// (spec §4.3: "must return all reservations whose [start,end) covers t
    /// and whose state is not terminal; this is the hot-path query for
    /// allocation"). Terminal filtering is the caller's responsibility since
    /// the calendar only stores capacity commitments, not reservation state;
    /// callers remove holdings for terminal reservations via `remove_holding`
    /// at close time, so anything present here is by construction active.
    pub fn holdings_at(&self, node: GraphNodeId, t: DateTime<Utc>) -> Vec<&Holding> {
        self.holdings.get(&node).map(|list| list.iter().filter(|h| h.start <= t && t < h.end).collect()).unwrap_or_default()
    }

    /// Sum of capacities committed on `node` that overlap `[start, end)`.
    pub fn committed_over(&self, node: GraphNodeId, start: DateTime<Utc>, end: DateTime<Utc>) -> Capacities {
        self.holdings
            .get(&node)
            .map(|list| {
                list.iter()
                    .filter(|h| h.start < end && start < h.end)
                    .fold(Capacities::default(), |acc, h| acc.saturating_add(&h.capacities))
            })
            .unwrap_or_default()
    }

    /// Same as `committed_over`, but ignores any holding belonging to
    /// `exclude`. Lets a policy re-validate a reservation it already holds
    /// capacity for without double-counting its own prior commitment
    /// (spec §4.4 "Idempotence": re-allocating must not shrink the
    /// reservation's own available capacity on retry).
    pub fn committed_over_excluding(&self, node: GraphNodeId, start: DateTime<Utc>, end: DateTime<Utc>, exclude: ReservationId) -> Capacities {
        self.holdings
            .get(&node)
            .map(|list| {
                list.iter()
                    .filter(|h| h.reservation_id != exclude && h.start < end && start < h.end)
                    .fold(Capacities::default(), |acc, h| acc.saturating_add(&h.capacities))
            })
            .unwrap_or_default()
    }

    /// Whether `reservation_id` already has a capacity commitment on `node`.
    pub fn has_holding(&self, node: GraphNodeId, reservation_id: ReservationId) -> bool {
        self.holdings.get(&node).map(|list| list.iter().any(|h| h.reservation_id == reservation_id)).unwrap_or(false)
    }
}
