use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;
use crate::id::{GraphNodeId, ReservationId, SliceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Vm,
    Baremetal,
    Container,
    Switch,
    L2Sts,
    L2Bridge,
    L2Ptp,
    FabNetv4,
    FabNetv4Ext,
    FabNetv6,
    FabNetv6Ext,
    L3Vpn,
    PortMirror,
}

impl ResourceType {
    /// Network-service kinds take the dependency/VLAN path of spec §4.4's
    /// "For network-service slivers, steps differ" branch.
    pub fn is_network_service(&self) -> bool {
        !matches!(self, ResourceType::Vm | ResourceType::Baremetal | ResourceType::Container | ResourceType::Switch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Capacities {
    pub cores: u32,
    pub ram_gb: u32,
    pub disk_gb: u32,
    pub bandwidth_gbps: u32,
}

impl Capacities {
    pub fn is_zero(&self) -> bool {
        self.cores == 0 && self.ram_gb == 0 && self.disk_gb == 0 && self.bandwidth_gbps == 0
    }

    pub fn le(&self, other: &Capacities) -> bool {
        self.cores <= other.cores && self.ram_gb <= other.ram_gb && self.disk_gb <= other.disk_gb && self.bandwidth_gbps <= other.bandwidth_gbps
    }

    pub fn saturating_add(&self, other: &Capacities) -> Capacities {
        Capacities {
            cores: self.cores + other.cores,
            ram_gb: self.ram_gb + other.ram_gb,
            disk_gb: self.disk_gb + other.disk_gb,
            bandwidth_gbps: self.bandwidth_gbps + other.bandwidth_gbps,
        }
    }

    pub fn saturating_sub(&self, other: &Capacities) -> Capacities {
        Capacities {
            cores: self.cores.saturating_sub(other.cores),
            ram_gb: self.ram_gb.saturating_sub(other.ram_gb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
            bandwidth_gbps: self.bandwidth_gbps.saturating_sub(other.bandwidth_gbps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequest {
    pub model: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Nascent,
    Ticketed,
    Active,
    ActiveTicketed,
    Closed,
    CloseWait,
    Failed,
    Unknown,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Closed | ReservationState::Failed)
    }

    /// Ordering used by the dependency rule (spec §4.2): a predecessor "at
    /// or past" `Ticketed` has its VLAN/MAC allocations known, which is the
    /// one progress-gating condition the spec names explicitly.
    pub fn rank(&self) -> u8 {
        match self {
            ReservationState::Nascent => 0,
            ReservationState::Unknown => 0,
            ReservationState::Ticketed => 1,
            ReservationState::Active => 2,
            ReservationState::ActiveTicketed => 2,
            ReservationState::CloseWait => 3,
            ReservationState::Closed => 4,
            ReservationState::Failed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PendingState {
    #[default]
    None,
    Ticketing,
    Redeeming,
    ExtendingTicket,
    ExtendingLease,
    Closing,
    Priming,
    Blocked,
    BlockedTicket,
    BlockedRedeem,
}

impl PendingState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, PendingState::Blocked | PendingState::BlockedTicket | PendingState::BlockedRedeem)
    }
}

/// `(graph_id, graph_node_id)` identifying the authoritative substrate node,
/// set by the broker before the authority sees the reservation (spec §3
/// invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMap {
    pub graph_id: GraphNodeId,
    pub graph_node_id: GraphNodeId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for LastError {
    fn from(e: &Error) -> Self {
        LastError { kind: e.kind().to_string(), message: e.to_string() }
    }
}

/// The unit of arbitration for exactly one sliver. See spec §3 "Reservation"
/// and §4.2 for the state machine this type enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub slice_id: SliceId,
    pub resource_type: ResourceType,
    /// Site this sliver is requested at, e.g. `"RENC"`; set by the
    /// orchestrator from the ASM node the sliver was built from (spec §4.6).
    pub site: String,

    pub requested: Capacities,
    pub requested_components: Vec<ComponentRequest>,
    pub label_requests: HashMap<String, String>,

    pub lease_start: DateTime<Utc>,
    pub lease_end: DateTime<Utc>,

    pub state: ReservationState,
    pub pending: PendingState,

    pub approved: Capacities,
    pub allocated_components: Vec<ComponentRequest>,
    pub node_map: Option<NodeMap>,

    pub predecessors: Vec<ReservationId>,

    pub retry_count: u32,
    pub last_error: Option<LastError>,
    pub properties: HashMap<String, String>,
}

impl Reservation {
    pub fn new(
        slice_id: SliceId,
        resource_type: ResourceType,
        requested: Capacities,
        requested_components: Vec<ComponentRequest>,
        lease_start: DateTime<Utc>,
        lease_end: DateTime<Utc>,
    ) -> Self {
        Reservation::with_site(slice_id, String::new(), resource_type, requested, requested_components, lease_start, lease_end)
    }

    pub fn with_site(
        slice_id: SliceId,
        site: String,
        resource_type: ResourceType,
        requested: Capacities,
        requested_components: Vec<ComponentRequest>,
        lease_start: DateTime<Utc>,
        lease_end: DateTime<Utc>,
    ) -> Self {
        Reservation {
            id: ReservationId::new(),
            slice_id,
            resource_type,
            site,
            requested,
            requested_components,
            label_requests: HashMap::new(),
            lease_start,
            lease_end,
            state: ReservationState::Nascent,
            pending: PendingState::None,
            approved: Capacities::default(),
            allocated_components: Vec::new(),
            node_map: None,
            predecessors: Vec::new(),
            retry_count: 0,
            last_error: None,
            properties: HashMap::new(),
        }
    }

    /// Validates the invariants spec §8 lists as boundary behaviors:
    /// zero-capacity and inverted lease windows are `InvalidRequest`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.requested.is_zero() {
            return Err(Error::InvalidRequest("zero-capacity request".to_string()));
        }
        if self.lease_end <= self.lease_start {
            return Err(Error::InvalidRequest("lease-end must be after lease-start".to_string()));
        }
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.pending.is_blocked()
    }

    fn fail(&mut self, err: Error) {
        self.last_error = Some(LastError::from(&err));
        self.state = ReservationState::Failed;
        self.pending = PendingState::None;
    }

    /// `Nascent --ticket accepted--> Ticketed` / `Nascent --refused--> Failed`.
    pub fn on_ticket_result(&mut self, granted: Capacities, node_map: Option<NodeMap>, components: Vec<ComponentRequest>, err: Option<Error>) {
        if self.state != ReservationState::Nascent {
            return;
        }
        match err {
            Some(e) => self.fail(e),
            None => {
                self.approved = granted;
                self.node_map = node_map;
                self.allocated_components = components;
                self.state = ReservationState::Ticketed;
                self.pending = PendingState::None;
            }
        }
    }

    /// `Ticketed --redeem accepted & bound--> Ticketed/Priming` (waits for
    /// lease-start tick).
    pub fn on_redeem_bound(&mut self) -> Result<(), Error> {
        if self.state != ReservationState::Ticketed {
            return Err(Error::InvalidRequest(format!("cannot redeem reservation in state {:?}", self.state)));
        }
        self.pending = PendingState::Redeeming;
        Ok(())
    }

    /// Lease-start tick reached: handler invocation starts.
    pub fn on_lease_start_reached(&mut self) {
        if self.state == ReservationState::Ticketed && self.pending == PendingState::Redeeming {
            self.pending = PendingState::Priming;
        }
    }

    /// Handler completion: success moves to `Active`, failure to `Failed`.
    pub fn on_handler_result(&mut self, ok: bool, properties: HashMap<String, String>, err: Option<Error>) {
        if self.pending != PendingState::Priming {
            return;
        }
        if ok {
            self.properties.extend(properties);
            self.state = ReservationState::Active;
            self.pending = PendingState::None;
        } else {
            let e = err.unwrap_or_else(|| Error::HandlerFailure("handler reported failure".to_string()));
            self.fail(e);
        }
    }

    /// `Active --extend accepted--> ActiveTicketed`.
    pub fn on_extend_accepted(&mut self, new_lease_end: DateTime<Utc>, approved: Capacities) -> Result<(), Error> {
        if self.state != ReservationState::Active {
            return Err(Error::InvalidRequest(format!("cannot extend reservation in state {:?}", self.state)));
        }
        self.lease_end = new_lease_end;
        self.approved = approved;
        self.state = ReservationState::ActiveTicketed;
        self.pending = PendingState::ExtendingLease;
        Ok(())
    }

    /// `ActiveTicketed --new lease redeemed at authority--> Active`.
    pub fn on_lease_swapped(&mut self) -> Result<(), Error> {
        if self.state != ReservationState::ActiveTicketed {
            return Err(Error::InvalidRequest(format!("cannot swap lease for reservation in state {:?}", self.state)));
        }
        self.state = ReservationState::Active;
        self.pending = PendingState::None;
        Ok(())
    }

    /// `any --close requested--> */Closing --> CloseWait`. A no-op on an
    /// already-`Closed` reservation (spec §8 idempotence requirement).
    pub fn on_close_requested(&mut self) {
        if self.state == ReservationState::Closed {
            return;
        }
        self.pending = PendingState::Closing;
    }

    /// `CloseWait --teardown done--> Closed`.
    pub fn on_teardown_done(&mut self) -> Result<(), Error> {
        self.state = ReservationState::Closed;
        self.pending = PendingState::None;
        Ok(())
    }

    /// Marks the reservation `CloseWait` once teardown has been requested;
    /// modeled as a distinct step because the handler invocation for close
    /// is itself asynchronous (mirrors `on_lease_start_reached`/`Priming`).
    pub fn on_teardown_started(&mut self) {
        if self.pending == PendingState::Closing {
            self.state = ReservationState::CloseWait;
        }
    }

    /// Dependency rule: a predecessor reaching `Failed` fails this
    /// reservation if it is currently blocked on that predecessor.
    pub fn on_predecessor_failed(&mut self, predecessor: ReservationId) {
        if self.predecessors.contains(&predecessor) && self.is_blocked() {
            self.fail(Error::PredecessorFailed(format!("predecessor {predecessor} failed")));
        }
    }

    pub fn block_on_predecessors(&mut self, kind: PendingState) {
        debug_assert!(kind.is_blocked());
        self.pending = kind;
    }
}
