pub mod event;
pub mod role;

use actix::{Actor, Context, Handler};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::calendar::Calendar;
use crate::clock::{Clock, Tick as LogicalTick};
use crate::config::ActorType;
use crate::domain::delegation::Delegation;
use crate::domain::graph::GraphModel;
use crate::domain::peer::PeerCatalog;
use crate::domain::reservation::{Capacities, PendingState, Reservation, ReservationState};
use crate::domain::slice::Slice;
use crate::error::Error;
use crate::handler::HandlerRegistry;
use crate::id::{ActorGuid, DelegationId, MsgId, ReservationId, SliceId};
use crate::metrics::KernelMetrics;
use crate::persistence::store::{CommitBatch, Store};
use crate::policy::orchestrator::{dependencies_satisfied, failed_predecessor, RequestGraph};
use crate::protocol::messages::{Envelope, MessageBody, OperationResult};

pub use event::{HandlerCompleted, Inbound, TimeoutFired, Tick};
pub use role::ActorRole;

/// Result of one `KernelState::tick()`: the pure, synchronously-computed
/// outcome. The actix `Kernel` actor wrapping this state is the only thing
/// that touches I/O (bus publish, spawning provisioning tasks); everything
/// above this line is plain, deterministic, and unit-testable without an
/// actix runtime.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub outgoing: Vec<(String, Envelope)>,
    pub to_provision: Vec<ReservationId>,
    pub to_teardown: Vec<ReservationId>,
}

/// Bounded FIFO window used for `msg_id` deduplication (spec §4.7): at-least-
/// once delivery means the same message may arrive twice, and the kernel
/// must idempotently re-process it keyed by reservation id rather than
/// double-apply its effect.
struct DedupWindow {
    seen: HashSet<MsgId>,
    order: VecDeque<MsgId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        DedupWindow { seen: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Returns `true` if `id` was already seen (i.e. this delivery is a
    /// replay); otherwise records it and returns `false`.
    fn check_and_record(&mut self, id: MsgId) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        self.seen.insert(id);
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }
}

/// All single-threaded, cooperatively-owned state of one actor (spec §4.1,
/// §5). Exactly one `KernelState` per process; everything that would touch
/// it from another thread is represented as an event that the owning actix
/// actor (`Kernel`) hands to `tick`/`handle_*` on its own mailbox turn.
pub struct KernelState {
    pub actor_guid: ActorGuid,
    pub callback_topic: String,
    pub role: ActorRole,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<KernelMetrics>,
    pub handler_registry: HandlerRegistry,
    pub resource_map: HashMap<String, String>,

    pub slices: HashMap<SliceId, Slice>,
    pub reservations: HashMap<ReservationId, Reservation>,
    pub delegations: HashMap<DelegationId, Delegation>,
    pub graph: GraphModel,
    pub calendar: Calendar,
    pub peers: PeerCatalog,

    /// Id of this actor's own graph (CBM at a broker, ARM at an authority),
    /// written into `node_map.graph_id` when the broker grants a ticket.
    pub own_graph_id: crate::id::GraphNodeId,

    /// Where to route a reservation's next outbound message: the peer that
    /// most recently sent it to us, and the topic to reply on.
    reservation_origin: HashMap<ReservationId, (ActorGuid, String)>,

    inbox: VecDeque<Envelope>,
    dedup: DedupWindow,
    dirty_reservations: HashSet<ReservationId>,
    dirty_slices: HashSet<SliceId>,
    event_batch_cap: usize,
    commit_batch_size: usize,
    /// Retries allowed for an outstanding RPC before the reservation is
    /// failed outright (spec §5 "Cancellation and timeouts",
    /// `transport.rpc_retries`).
    rpc_retries: u32,
}

impl KernelState {
    pub fn new(
        actor_guid: ActorGuid,
        callback_topic: impl Into<String>,
        role: ActorRole,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        metrics: Arc<KernelMetrics>,
    ) -> Self {
        KernelState {
            actor_guid,
            callback_topic: callback_topic.into(),
            role,
            clock,
            store,
            metrics,
            handler_registry: HandlerRegistry::new(),
            resource_map: HashMap::new(),
            slices: HashMap::new(),
            reservations: HashMap::new(),
            delegations: HashMap::new(),
            graph: GraphModel::new(),
            calendar: Calendar::new(),
            peers: PeerCatalog::default(),
            own_graph_id: crate::id::GraphNodeId::new(),
            reservation_origin: HashMap::new(),
            inbox: VecDeque::new(),
            dedup: DedupWindow::new(4096),
            dirty_reservations: HashSet::new(),
            dirty_slices: HashSet::new(),
            event_batch_cap: 256,
            commit_batch_size: 1,
            rpc_retries: 5,
        }
    }

    pub fn with_commit_batch_size(mut self, n: usize) -> Self {
        self.commit_batch_size = n.max(1);
        self
    }

    pub fn with_rpc_retries(mut self, n: u32) -> Self {
        self.rpc_retries = n;
        self
    }

    pub fn with_event_batch_cap(mut self, n: usize) -> Self {
        self.event_batch_cap = n.max(1);
        self
    }

    pub fn with_peers(mut self, peers: PeerCatalog) -> Self {
        self.peers = peers;
        self
    }

    fn mark_dirty(&mut self, reservation_id: ReservationId) {
        self.dirty_reservations.insert(reservation_id);
    }

    /// Recomputes the slice a reservation belongs to from the current states
    /// of all its member reservations (spec §7), marking it dirty if found.
    /// Called wherever a reservation's `state` changes so `StableOk` /
    /// `StableError` / `Dead` are not only reachable from unit tests.
    fn recompute_slice_for(&mut self, rid: ReservationId) {
        let Some(slice_id) = self.reservations.get(&rid).map(|r| r.slice_id) else { return };
        let Some(slice) = self.slices.get(&slice_id) else { return };
        let states: Vec<(ReservationState, PendingState)> = slice.reservation_ids.iter().filter_map(|id| self.reservations.get(id).map(|r| (r.state, r.pending))).collect();
        if let Some(slice) = self.slices.get_mut(&slice_id) {
            slice.recompute_state(&states);
        }
        self.dirty_slices.insert(slice_id);
    }

    /// Step 6 of spec §4.1: "persist dirty reservations in a single batch".
    /// Commits only once `dirty_reservations.len() >= commit_batch_size`
    /// (default 1, i.e. commit every tick that produced a change).
    fn commit_dirty(&mut self) {
        if self.dirty_reservations.len() < self.commit_batch_size && self.dirty_slices.is_empty() {
            return;
        }
        let batch = CommitBatch {
            slices: self.dirty_slices.iter().filter_map(|id| self.slices.get(id).cloned()).collect(),
            reservations: self.dirty_reservations.iter().filter_map(|id| self.reservations.get(id).cloned()).collect(),
            delegations: self.delegations.values().cloned().collect(),
        };
        if batch.is_empty() {
            return;
        }
        match self.store.commit(&batch) {
            Ok(()) => {
                self.metrics.record_commit();
                self.dirty_reservations.clear();
                self.dirty_slices.clear();
            }
            Err(e) => {
                tracing::error!(target: crate::logger::KERNEL_TICK_TARGET, error = %e, "commit failed; will retry next tick");
            }
        }
    }

    /// Enqueues an inbound envelope for processing on the next tick's batch
    /// drain (spec §4.1 event kind 1).
    pub fn enqueue_inbound(&mut self, envelope: Envelope) {
        self.inbox.push_back(envelope);
    }

    fn dispatch_envelope(&mut self, envelope: Envelope, outgoing: &mut Vec<(String, Envelope)>) {
        if self.dedup.check_and_record(envelope.msg_id) {
            tracing::debug!(target: crate::logger::KERNEL_TICK_TARGET, msg_id = %envelope.msg_id, "duplicate message ignored (at-least-once replay)");
            return;
        }
        let source = envelope.source_actor_guid;
        let reply_topic = envelope.callback_topic.clone();

        match envelope.body {
            MessageBody::Ticket { reservations } => {
                let tick = self.clock.tick();
                for mut r in reservations {
                    r.pending = PendingState::Ticketing;
                    self.reservation_origin.insert(r.id, (source, reply_topic.clone()));
                    self.slices.entry(r.slice_id).or_insert_with(|| {
                        Slice::new("unnamed", crate::domain::slice::Owner { user: "unknown".into(), project: "unknown".into() }, r.lease_start, r.lease_end)
                    });

                    // spec §4.4: the broker consults its CBM/calendar right
                    // away rather than parking the reservation in a pending
                    // state first; other roles reject a misdirected Ticket.
                    let outcome = match &self.role {
                        ActorRole::Broker(policy) => policy.allocate_ticket(&self.graph, &mut self.calendar, &self.delegations, &mut r, self.own_graph_id, tick, &self.reservations),
                        _ => Err(Error::InvalidRequest("Ticket received by a non-broker actor".to_string())),
                    };
                    let reply = match outcome {
                        Ok(()) => {
                            r.on_ticket_result(r.approved, r.node_map, r.allocated_components.clone(), None);
                            MessageBody::UpdateTicket { reservation: r.clone(), result: OperationResult::ok() }
                        }
                        Err(e) => {
                            r.on_ticket_result(Capacities::default(), None, vec![], Some(e.clone()));
                            self.metrics.record_failed();
                            MessageBody::UpdateTicket { reservation: r.clone(), result: OperationResult::failed(e) }
                        }
                    };
                    outgoing.push((reply_topic.clone(), Envelope::new(self.actor_guid, self.callback_topic.clone(), reply)));
                    self.dirty_reservations.insert(r.id);
                    let rid = r.id;
                    self.reservations.insert(rid, r);
                    self.recompute_slice_for(rid);
                }
            }
            MessageBody::Redeem { mut reservation } => {
                self.reservation_origin.insert(reservation.id, (source, reply_topic.clone()));

                // spec §4.5: the authority verifies ownership and recomputes
                // availability from its ARM before binding the reservation
                // to its own calendar; other roles reject a misdirected Redeem.
                let outcome = match &self.role {
                    ActorRole::Authority(policy) => policy.redeem(&self.graph, &mut self.calendar, &self.delegations, &mut reservation),
                    _ => Err(Error::InvalidRequest("Redeem received by a non-authority actor".to_string())),
                };
                if let Err(e) = outcome {
                    reservation.last_error = Some((&e).into());
                    reservation.state = ReservationState::Failed;
                    reservation.pending = PendingState::None;
                    self.metrics.record_failed();
                    outgoing.push((reply_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::UpdateLease { reservation: reservation.clone(), result: OperationResult::failed(e) })));
                }
                self.dirty_reservations.insert(reservation.id);
                let rid = reservation.id;
                self.reservations.insert(rid, reservation);
                self.recompute_slice_for(rid);
            }
            MessageBody::UpdateTicket { reservation, result } => {
                self.apply_peer_update(reservation, result, false);
            }
            MessageBody::UpdateLease { reservation, result } => {
                self.apply_peer_update(reservation, result, true);
            }
            MessageBody::Close { reservation_id } => {
                if !self.reservations.contains_key(&reservation_id) {
                    return;
                }
                if let Some(r) = self.reservations.get_mut(&reservation_id) {
                    r.on_close_requested();
                }
                match self.role {
                    // authority: handler teardown is invoked on the next
                    // tick via the closing bucket (spec §5).
                    ActorRole::Authority(_) => {
                        self.calendar.add_closing(reservation_id, self.clock.now());
                    }
                    // broker/orchestrator: no substrate handler to call; a
                    // close message is all that's needed, so the reservation
                    // completes its teardown immediately.
                    ActorRole::Broker(_) | ActorRole::Orchestrator(_) => {
                        if let Some(r) = self.reservations.get_mut(&reservation_id) {
                            r.on_teardown_started();
                            let _ = r.on_teardown_done();
                        }
                        self.calendar.remove_holding_anywhere(reservation_id);
                        self.metrics.record_closed();
                    }
                }
                self.dirty_reservations.insert(reservation_id);
                self.recompute_slice_for(reservation_id);
            }
            MessageBody::Probe => {
                outgoing.push((reply_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::Probe)));
            }
            MessageBody::Query { level } => {
                let payload = match level {
                    crate::protocol::messages::QueryLevel::Summary => Vec::new(),
                    crate::protocol::messages::QueryLevel::Full => self.reservations.values().cloned().collect(),
                };
                outgoing.push((reply_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::QueryResponse { payload })));
            }
            MessageBody::ExtendTicket { reservation_id, new_lease_end } => {
                self.reservation_origin.insert(reservation_id, (source, reply_topic.clone()));
                if let Some(mut r) = self.reservations.get(&reservation_id).cloned() {
                    // spec §4.6 renewal, broker half: a capacity pre-check
                    // against the already-assigned node, no relocation.
                    let outcome = match &self.role {
                        ActorRole::Broker(policy) => policy.extend(&mut self.calendar, &self.delegations, &mut r, new_lease_end),
                        _ => Err(Error::InvalidRequest("ExtendTicket received by a non-broker actor".to_string())),
                    };
                    let reply = match outcome {
                        Ok(()) => {
                            r.lease_end = new_lease_end;
                            MessageBody::UpdateTicket { reservation: r.clone(), result: OperationResult::ok() }
                        }
                        Err(e) => {
                            self.metrics.record_failed();
                            MessageBody::UpdateTicket { reservation: r.clone(), result: OperationResult::failed(e) }
                        }
                    };
                    outgoing.push((reply_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), reply)));
                    self.dirty_reservations.insert(r.id);
                    self.reservations.insert(reservation_id, r);
                }
            }
            MessageBody::ExtendLease { reservation_id, new_lease_end } => {
                self.reservation_origin.insert(reservation_id, (source, reply_topic.clone()));
                if let Some(mut r) = self.reservations.get(&reservation_id).cloned() {
                    // spec §4.6 renewal, authority half: extend-then-swap
                    // against this actor's own Active copy (mirrors
                    // `on_ticket_result`/`on_redeem_bound` running locally
                    // per actor rather than over the wire).
                    let outcome = match &self.role {
                        ActorRole::Authority(policy) => (|| {
                            r.on_extend_accepted(new_lease_end, r.approved)?;
                            policy.extend(&self.graph, &mut self.calendar, &self.delegations, &mut r, new_lease_end)?;
                            r.on_lease_swapped()
                        })(),
                        _ => Err(Error::InvalidRequest("ExtendLease received by a non-authority actor".to_string())),
                    };
                    let reply = match outcome {
                        Ok(()) => MessageBody::UpdateLease { reservation: r.clone(), result: OperationResult::ok() },
                        Err(e) => {
                            r.last_error = Some((&e).into());
                            self.metrics.record_failed();
                            MessageBody::UpdateLease { reservation: r.clone(), result: OperationResult::failed(e) }
                        }
                    };
                    outgoing.push((reply_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), reply)));
                    self.dirty_reservations.insert(r.id);
                    self.reservations.insert(reservation_id, r);
                    self.recompute_slice_for(reservation_id);
                }
            }
            MessageBody::Claim { delegation } => {
                self.delegations.insert(delegation.id, delegation);
            }
            MessageBody::Reclaim { delegation_id } => {
                let holdings = self.delegations.get(&delegation_id).map(|d| self.delegation_active_holdings(d));
                if let (Some(holdings), Some(delegation)) = (holdings, self.delegations.get_mut(&delegation_id)) {
                    if let Err(e) = delegation.reclaim(&holdings) {
                        tracing::warn!(target: crate::logger::KERNEL_TICK_TARGET, delegation_id = %delegation_id, error = %e, "reclaim rejected: active holdings remain on delegated nodes");
                    }
                }
            }
            MessageBody::QueryResponse { .. } => {}
        }
    }

    /// Sum of capacity currently held by any reservation on a delegation's
    /// nodes, at the current tick (spec §3 Delegation, Open Question #3): the
    /// gate `Delegation::reclaim` checks before tearing down a delegation.
    fn delegation_active_holdings(&self, delegation: &Delegation) -> Capacities {
        let now = self.clock.now();
        delegation.node_capacities.keys().fold(Capacities::default(), |acc, &node| {
            self.calendar.holdings_at(node, now).iter().fold(acc, |acc2, h| acc2.saturating_add(&h.capacities))
        })
    }

    fn apply_peer_update(&mut self, remote: Reservation, result: OperationResult, is_lease: bool) {
        let id = remote.id;
        let entry = self.reservations.entry(id).or_insert_with(|| remote.clone());
        *entry = remote;
        if let Some(e) = result.error {
            entry.last_error = Some((&e).into());
            if !is_lease {
                entry.state = ReservationState::Failed;
            }
        }
        self.dirty_reservations.insert(id);
        self.recompute_slice_for(id);
    }

    /// Orchestrator side of spec §4.6/§4.4: sends a freshly-built (or
    /// retried) `Ticketing`-pending reservation to the configured broker
    /// peer. Left in `Ticketing` until the broker's `UpdateTicket` reply
    /// overwrites it via `apply_peer_update`.
    fn emit_ticket_request(&mut self, rid: ReservationId, outgoing: &mut Vec<(String, Envelope)>) {
        if !matches!(self.role, ActorRole::Orchestrator(_)) {
            return;
        }
        let Some(reservation) = self.reservations.get(&rid) else { return };
        let Some(broker) = self.peers.by_type(ActorType::Broker).next() else {
            tracing::error!(target: crate::logger::KERNEL_TICK_TARGET, reservation_id = %rid, "no broker peer configured; cannot emit Ticket");
            return;
        };
        let topic = broker.inbound_topic.clone();
        let envelope = Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::Ticket { reservations: vec![reservation.clone()] });
        outgoing.push((topic, envelope));
    }

    /// Orchestrator-only entry point that turns a request graph into a new
    /// slice's reservations (spec §4.6) and registers them so the next tick
    /// advances each one: `Ticketing` reservations get a `Ticket` emitted via
    /// `emit_ticket_request`, `BlockedRedeem` ones wait on the dependency
    /// rule. The REST surface that would normally call this is out of scope
    /// (spec §1); this is its call boundary.
    pub fn submit_slice(
        &mut self,
        name: impl Into<String>,
        owner: crate::domain::slice::Owner,
        graph: &RequestGraph,
        lease_start: chrono::DateTime<chrono::Utc>,
        lease_end: chrono::DateTime<chrono::Utc>,
    ) -> Result<SliceId, Error> {
        if !matches!(self.role, ActorRole::Orchestrator(_)) {
            return Err(Error::InvalidRequest("submit_slice is only valid on an orchestrator actor".to_string()));
        }
        let name = name.into();
        if self.slices.values().any(|s| s.conflicts_with(&owner, &name)) {
            return Err(Error::InvalidRequest(format!("a non-terminal slice named {name:?} already exists for this owner")));
        }
        let mut slice = Slice::new(name, owner, lease_start, lease_end);
        let reservations = {
            let ActorRole::Orchestrator(policy) = &self.role else { unreachable!("checked above") };
            policy.build_slice_reservations(&mut slice, graph, lease_start, lease_end)?
        };
        let slice_id = slice.id;
        let tick = self.clock.tick();
        self.slices.insert(slice_id, slice);
        self.dirty_slices.insert(slice_id);
        for r in reservations {
            self.calendar.add_pending(r.id, tick);
            self.dirty_reservations.insert(r.id);
            self.reservations.insert(r.id, r);
        }
        Ok(slice_id)
    }

    /// Steps 3-4 of spec §4.1: advances reservations whose pending state
    /// permits progress, applying the dependency rule (spec §4.2) first.
    fn process_reservation_progress(&mut self, rid: ReservationId, now: chrono::DateTime<chrono::Utc>, tick: LogicalTick, outgoing: &mut Vec<(String, Envelope)>) {
        let Some(reservation) = self.reservations.get(&rid) else { return };
        let pending = reservation.pending;
        if pending == PendingState::Ticketing {
            self.emit_ticket_request(rid, outgoing);
            return;
        }
        if !reservation.is_blocked() {
            return;
        }

        if let Some(failed_pred) = failed_predecessor(reservation, &self.reservations) {
            if let Some(r) = self.reservations.get_mut(&rid) {
                r.on_predecessor_failed(failed_pred);
                self.metrics.record_failed();
            }
            self.dirty_reservations.insert(rid);
            self.recompute_slice_for(rid);
            return;
        }

        if dependencies_satisfied(reservation, &self.reservations) {
            let (origin_guid, origin_topic) = self.reservation_origin.get(&rid).cloned().unwrap_or((self.actor_guid, self.callback_topic.clone()));
            if let Some(r) = self.reservations.get_mut(&rid) {
                r.pending = PendingState::Redeeming;
                let envelope = Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::Redeem { reservation: r.clone() });
                outgoing.push((origin_topic, envelope));
            }
            let _ = origin_guid;
            self.dirty_reservations.insert(rid);
        } else {
            self.calendar.add_pending(rid, tick + 1);
        }
    }

    /// One full tick (spec §4.1 steps 1-6). Pure and synchronous: the
    /// caller (the `Kernel` actix actor) is responsible for actually
    /// publishing `outgoing` envelopes and spawning provisioning work for
    /// `to_provision`/`to_teardown`.
    pub fn tick(&mut self) -> TickOutcome {
        let tick = self.clock.tick();
        let now = self.clock.now();
        self.metrics.record_tick();

        let mut outgoing = Vec::new();

        // 1. drain local event queue up to batch cap.
        let mut drained = 0u64;
        while drained < self.event_batch_cap as u64 {
            let Some(envelope) = self.inbox.pop_front() else { break };
            self.dispatch_envelope(envelope, &mut outgoing);
            drained += 1;
        }
        self.metrics.record_events_drained(drained);

        // 2/3. advance calendar cursor; process due reservations in
        // slice-id order, then insertion order within a slice (spec §4.2
        // "Tie-breaking and ordering"). Reservation ids are UUIDv4 so we
        // sort by (slice_id, id) as a deterministic stand-in for insertion
        // order; a real persisted store would carry an explicit sequence.
        let mut due = self.calendar.due_before(tick);
        due.sort_by_key(|id| (self.reservations.get(id).map(|r| r.slice_id), *id));
        for rid in due {
            self.process_reservation_progress(rid, now, tick, &mut outgoing);
        }

        // 4. authority: lease-start reached -> hand to provisioning pool.
        let mut to_provision = Vec::new();
        if matches!(self.role, ActorRole::Authority(_)) {
            for rid in self.calendar.redeeming_due(now) {
                if let Some(r) = self.reservations.get_mut(&rid) {
                    r.on_lease_start_reached();
                    to_provision.push(rid);
                    self.dirty_reservations.insert(rid);
                }
            }
        }

        // closing bucket -> teardown, regardless of role (authority invokes
        // a handler; orchestrator/broker send a Close message instead, via
        // `to_teardown` handled by the caller per spec §5).
        let to_teardown = self.calendar.closing_before(now);

        // 6. persist dirty reservations/slices in a single batch.
        self.commit_dirty();

        TickOutcome { outgoing, to_provision, to_teardown }
    }

    /// Called by the `Kernel` actor when a provisioning/teardown handler
    /// completes (spec §4.5 step 5).
    pub fn handle_handler_completed(&mut self, rid: ReservationId, ok: bool, properties: HashMap<String, String>, error: Option<Error>, is_teardown: bool) -> Option<(String, Envelope)> {
        let Some(r) = self.reservations.get_mut(&rid) else { return None };
        if is_teardown {
            r.on_teardown_started();
            let _ = r.on_teardown_done();
            self.calendar.remove_holding_anywhere(rid);
            self.calendar.remove_closing(rid);
            self.metrics.record_closed();
        } else {
            r.on_handler_result(ok, properties, error);
            if !ok {
                self.metrics.record_failed();
            } else {
                self.calendar.add_closing(rid, r.lease_end);
            }
        }
        self.dirty_reservations.insert(rid);
        self.recompute_slice_for(rid);
        let (_, topic) = self.reservation_origin.get(&rid).cloned()?;
        let body = MessageBody::UpdateLease { reservation: self.reservations.get(&rid)?.clone(), result: OperationResult::ok() };
        Some((topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), body)))
    }

    /// An outstanding RPC's deadline expired (spec §5 "Cancellation and
    /// timeouts"). Up to `transport.rpc_retries` attempts, the reservation's
    /// outstanding request is resent as-is; past that it is finalized
    /// `Failed` rather than left stuck forever.
    pub fn handle_timeout(&mut self, rid: ReservationId, _correlation_id: MsgId) -> Vec<(String, Envelope)> {
        let mut outgoing = Vec::new();
        let Some(r) = self.reservations.get_mut(&rid) else { return outgoing };
        if r.state.is_terminal() {
            return outgoing;
        }
        r.retry_count += 1;
        r.last_error = Some((&Error::Timeout(format!("reservation {rid}"))).into());

        if r.retry_count > self.rpc_retries {
            r.state = ReservationState::Failed;
            r.pending = PendingState::None;
            self.metrics.record_failed();
            self.dirty_reservations.insert(rid);
            self.recompute_slice_for(rid);
            return outgoing;
        }

        let pending = r.pending;
        let reservation_clone = r.clone();
        self.dirty_reservations.insert(rid);

        let (_, origin_topic) = self.reservation_origin.get(&rid).cloned().unwrap_or((self.actor_guid, self.callback_topic.clone()));
        match pending {
            PendingState::Ticketing => self.emit_ticket_request(rid, &mut outgoing),
            PendingState::Redeeming => {
                outgoing.push((origin_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), MessageBody::Redeem { reservation: reservation_clone })));
            }
            PendingState::ExtendingTicket => {
                let body = MessageBody::ExtendTicket { reservation_id: rid, new_lease_end: reservation_clone.lease_end };
                outgoing.push((origin_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), body)));
            }
            PendingState::ExtendingLease => {
                let body = MessageBody::ExtendLease { reservation_id: rid, new_lease_end: reservation_clone.lease_end };
                outgoing.push((origin_topic, Envelope::new(self.actor_guid, self.callback_topic.clone(), body)));
            }
            _ => {}
        }
        outgoing
    }

    /// Restart recovery (spec §4.1, §8 scenario 6): repopulates in-memory
    /// state from the last committed snapshot before the clock starts
    /// ticking, rebuilding calendar buckets and holdings so a crash loses no
    /// progress. A reservation rehydrated mid-`Priming` is probed via its
    /// handler's `is_deleted`: a still-in-flight provision is left waiting
    /// for its original (now-lost) completion, a finished one is treated as
    /// a handler failure.
    pub async fn hydrate(&mut self, store: &dyn Store) -> Result<(), Error> {
        let snapshot = store.snapshot()?;
        let tick = self.clock.tick();

        for delegation in snapshot.delegations {
            self.delegations.insert(delegation.id, delegation);
        }
        for slice in snapshot.slices {
            self.slices.insert(slice.id, slice);
        }

        for mut reservation in snapshot.reservations {
            if reservation.state.is_terminal() {
                self.reservations.insert(reservation.id, reservation);
                continue;
            }

            if reservation.pending == PendingState::Priming {
                if let Some(handler) = self.handler_registry.resolve(reservation.resource_type, &self.resource_map) {
                    if handler.is_deleted(&reservation).await {
                        reservation.on_handler_result(false, HashMap::new(), Some(Error::HandlerFailure("substrate object missing after restart".to_string())));
                        self.metrics.record_failed();
                        self.dirty_reservations.insert(reservation.id);
                    }
                    // else: the substrate object was never created; resume
                    // waiting for the original completion in `Priming`.
                }
            }

            self.rehydrate_calendar_entry(&reservation, tick);
            self.reservations.insert(reservation.id, reservation);
        }

        for rid in self.reservations.keys().copied().collect::<Vec<_>>() {
            self.recompute_slice_for(rid);
        }

        Ok(())
    }

    /// Re-derives the due-queue/holding membership a live reservation would
    /// have accrued, from its persisted `state`/`pending` alone (spec §4.3).
    fn rehydrate_calendar_entry(&mut self, r: &Reservation, tick: LogicalTick) {
        if let Some(node_map) = r.node_map {
            if !r.approved.is_zero() {
                self.calendar.add_holding(node_map.graph_node_id, r.id, r.lease_start, r.lease_end, r.approved);
            }
        }
        match r.pending {
            PendingState::Ticketing | PendingState::Redeeming | PendingState::ExtendingTicket | PendingState::ExtendingLease | PendingState::Blocked | PendingState::BlockedTicket | PendingState::BlockedRedeem => {
                self.calendar.add_pending(r.id, tick);
            }
            PendingState::Closing => {
                self.calendar.add_closing(r.id, r.lease_end);
            }
            PendingState::Priming | PendingState::None => {
                if matches!(r.state, ReservationState::Active) {
                    self.calendar.add_closing(r.id, r.lease_end);
                }
            }
        }
    }
}

/// Thin actix actor wrapping `KernelState`. All I/O (bus publish,
/// provisioning-pool dispatch) happens here, outside the pure state
/// machine, so the state machine stays trivially unit-testable.
pub struct Kernel {
    pub state: KernelState,
    pub bus: Arc<dyn crate::protocol::bus::Bus>,
    /// Bounds the authority's concurrent `provision`/`teardown` invocations
    /// (spec §4.5 step 4, `actor.controls.provisioning_pool_size`).
    pub provisioning_pool: Arc<tokio::sync::Semaphore>,
}

impl Actor for Kernel {
    type Context = Context<Self>;
}

impl Kernel {
    /// Publishes every envelope the last tick produced onto the bus, off the
    /// kernel thread (spec §4.1 step 1 "producer pool").
    fn publish_outgoing(&self, outgoing: Vec<(String, Envelope)>) {
        let bus = self.bus.clone();
        for (topic, envelope) in outgoing {
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = bus.publish(&topic, envelope).await {
                    tracing::error!(target: crate::logger::KERNEL_TICK_TARGET, topic = %topic, error = %e, "failed to publish outbound envelope");
                }
            });
        }
    }

    /// Hands a reservation to the provisioning pool (spec §4.5 step 4): a
    /// bounded-concurrency task resolves the handler for the reservation's
    /// resource type, invokes `provision`/`teardown`, and reports the result
    /// back to the kernel via `HandlerCompleted` so only this thread ever
    /// mutates reservation state.
    fn spawn_handler_invocation(&self, rid: ReservationId, is_teardown: bool, ctx: &mut Context<Self>) {
        let Some(reservation) = self.state.reservations.get(&rid).cloned() else { return };
        let handler = self.state.handler_registry.resolve(reservation.resource_type, &self.state.resource_map);
        let Some(handler) = handler else {
            tracing::error!(
                target: crate::logger::KERNEL_TICK_TARGET,
                reservation_id = %rid,
                resource_type = ?reservation.resource_type,
                "no handler registered for resource type; failing reservation"
            );
            ctx.address().do_send(HandlerCompleted {
                reservation_id: rid,
                ok: false,
                properties: HashMap::new(),
                error: Some(Error::HandlerFailure(format!("no handler registered for {:?}", reservation.resource_type))),
                is_teardown,
            });
            return;
        };
        let semaphore = self.provisioning_pool.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let outcome = if is_teardown { handler.teardown(&reservation).await } else { handler.provision(&reservation).await };
            addr.do_send(HandlerCompleted {
                reservation_id: rid,
                ok: outcome.ok,
                properties: outcome.properties,
                error: outcome.error,
                is_teardown,
            });
        });
    }
}

impl Handler<Tick> for Kernel {
    type Result = ();

    fn handle(&mut self, _msg: Tick, ctx: &mut Self::Context) {
        let outcome = self.state.tick();
        self.publish_outgoing(outcome.outgoing);
        for rid in outcome.to_provision {
            tracing::info!(target: crate::logger::KERNEL_TICK_TARGET, reservation_id = %rid, "handing reservation to provisioning pool");
            self.spawn_handler_invocation(rid, false, ctx);
        }
        for rid in outcome.to_teardown {
            tracing::info!(target: crate::logger::KERNEL_TICK_TARGET, reservation_id = %rid, "reservation due for teardown");
            self.spawn_handler_invocation(rid, true, ctx);
        }
    }
}

impl Handler<Inbound> for Kernel {
    type Result = ();

    fn handle(&mut self, msg: Inbound, _ctx: &mut Self::Context) {
        self.state.enqueue_inbound(msg.0);
    }
}

impl Handler<TimeoutFired> for Kernel {
    type Result = ();

    fn handle(&mut self, msg: TimeoutFired, _ctx: &mut Self::Context) {
        let outgoing = self.state.handle_timeout(msg.reservation_id, msg.correlation_id);
        self.publish_outgoing(outgoing);
    }
}

impl Handler<HandlerCompleted> for Kernel {
    type Result = ();

    fn handle(&mut self, msg: HandlerCompleted, _ctx: &mut Self::Context) {
        if let Some(reply) = self.state.handle_handler_completed(msg.reservation_id, msg.ok, msg.properties, msg.error, msg.is_teardown) {
            self.publish_outgoing(vec![reply]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppedClock;
    use crate::persistence::store::MemStore;
    use crate::policy::BrokerPolicy;
    use chrono::Utc;

    fn make_state() -> KernelState {
        let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(Utc::now(), 1000, 0));
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let metrics = Arc::new(KernelMetrics::new());
        KernelState::new(ActorGuid::new(), "broker-1-in", ActorRole::Broker(BrokerPolicy::new(Default::default())), clock, store, metrics)
    }

    #[test]
    fn tick_drains_inbox_and_commits_dirty_reservations() {
        let mut state = make_state();
        let slice_id = SliceId::new();
        let mut r = Reservation::new(
            slice_id,
            crate::domain::reservation::ResourceType::Vm,
            crate::domain::reservation::Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
            vec![],
            Utc::now(),
            Utc::now() + chrono::Duration::hours(1),
        );
        r.pending = PendingState::BlockedRedeem;
        let rid = r.id;
        state.reservations.insert(rid, r);
        state.calendar.add_pending(rid, 0);

        let outcome = state.tick();
        // No predecessors -> dependencies_satisfied trivially true -> a
        // Redeem envelope should have been queued for the origin topic.
        assert_eq!(outcome.outgoing.len(), 1);
        assert_eq!(state.reservations.get(&rid).unwrap().pending, PendingState::Redeeming);
    }

    #[test]
    fn dedup_window_suppresses_replayed_msg_id() {
        let mut window = DedupWindow::new(8);
        let id = MsgId::new();
        assert!(!window.check_and_record(id));
        assert!(window.check_and_record(id));
    }

    #[test]
    #[tracing_test::traced_test]
    fn replayed_envelope_logs_a_debug_line() {
        let mut state = make_state();
        let mut outgoing = Vec::new();
        let envelope = Envelope::new(state.actor_guid, state.callback_topic.clone(), MessageBody::Probe);
        state.dispatch_envelope(envelope.clone(), &mut outgoing);
        state.dispatch_envelope(envelope, &mut outgoing);
        assert!(tracing_test::logs_contain("duplicate message ignored"));
    }

    #[test]
    fn replayed_ticket_does_not_double_add_holding() {
        use crate::domain::graph::GraphNode;

        let mut state = make_state();
        let node = GraphNode::new("RENC", crate::domain::reservation::ResourceType::Vm, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
        let node_id = state.graph.insert(node);
        let mut delegation = Delegation::new(ActorGuid::new(), ActorGuid::new(), crate::id::GraphNodeId::new());
        delegation.delegate(node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
        state.delegations.insert(delegation.id, delegation);

        let r = Reservation::with_site(
            SliceId::new(),
            "RENC".to_string(),
            crate::domain::reservation::ResourceType::Vm,
            Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
            vec![],
            Utc::now(),
            Utc::now() + chrono::Duration::hours(1),
        );

        let envelope = Envelope::new(ActorGuid::new(), "orch-1-in", MessageBody::Ticket { reservations: vec![r] });
        let mut outgoing = Vec::new();
        state.dispatch_envelope(envelope.clone(), &mut outgoing);
        state.dispatch_envelope(envelope, &mut outgoing);

        assert_eq!(outgoing.len(), 1, "a replayed Ticket must not be allocated a second time");
        assert_eq!(state.calendar.holdings_at(node_id, Utc::now()).len(), 1);
    }

    #[test]
    fn submit_slice_on_orchestrator_emits_ticket_next_tick() {
        let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(Utc::now(), 1000, 0));
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let metrics = Arc::new(KernelMetrics::new());
        let peers = PeerCatalog::from_config(&[crate::config::PeerConfig {
            guid: "broker-1".into(),
            actor_type: ActorType::Broker,
            topic: "broker-1-in".into(),
            delegation: None,
        }]);
        let mut state = KernelState::new(ActorGuid::new(), "orch-1-in", ActorRole::Orchestrator(crate::policy::OrchestratorPolicy::default()), clock, store, metrics).with_peers(peers);

        let now = Utc::now();
        let graph = RequestGraph {
            nodes: vec![crate::policy::orchestrator::NodeRequest {
                site: "RENC".into(),
                resource_type: crate::domain::reservation::ResourceType::Vm,
                capacities: Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
                components: vec![],
            }],
            services: vec![],
        };
        let owner = crate::domain::slice::Owner { user: "alice".into(), project: "p1".into() };
        state.submit_slice("s1", owner, &graph, now, now + chrono::Duration::hours(1)).unwrap();

        let outcome = state.tick();
        assert_eq!(outcome.outgoing.len(), 1);
        assert_eq!(outcome.outgoing[0].0, "broker-1-in");
        assert!(matches!(outcome.outgoing[0].1.body, MessageBody::Ticket { .. }));
    }

    #[tokio::test]
    async fn hydrate_resolves_stuck_priming_reservation_via_is_deleted_probe() {
        use crate::handler::{Handler, HandlerOutcome};
        use crate::persistence::store::CommitBatch;

        struct StubHandler;
        #[async_trait::async_trait]
        impl Handler for StubHandler {
            async fn provision(&self, _r: &Reservation) -> HandlerOutcome {
                HandlerOutcome::success(HashMap::new())
            }
            async fn teardown(&self, _r: &Reservation) -> HandlerOutcome {
                HandlerOutcome::success(HashMap::new())
            }
            async fn is_deleted(&self, _r: &Reservation) -> bool {
                true
            }
        }

        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let start = Utc::now();
        let mut r = Reservation::new(
            SliceId::new(),
            crate::domain::reservation::ResourceType::Vm,
            Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
            vec![],
            start,
            start + chrono::Duration::hours(1),
        );
        r.state = ReservationState::Ticketed;
        r.pending = PendingState::Priming;
        let rid = r.id;
        store.commit(&CommitBatch { reservations: vec![r], ..Default::default() }).unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(start, 1000, 0));
        let metrics = Arc::new(KernelMetrics::new());
        let mut state = KernelState::new(ActorGuid::new(), "auth-1-in", ActorRole::Authority(crate::policy::AuthorityPolicy::new(1.0)), clock, store.clone(), metrics);
        state.handler_registry.register("noop", Arc::new(StubHandler));
        state.resource_map.insert("Vm".to_string(), "noop".to_string());

        state.hydrate(store.as_ref()).await.unwrap();

        let rehydrated = &state.reservations[&rid];
        assert_eq!(rehydrated.state, ReservationState::Failed, "a positive is_deleted probe treats Priming as a lost handler completion");
    }
}
