use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::reservation::{Capacities, ComponentRequest, Reservation, ReservationState, ResourceType};
use crate::domain::slice::Slice;
use crate::error::Error;
use crate::id::ReservationId;

/// One requested node sliver in the ASM (request graph), the orchestrator's
/// unit of input before it is turned into a `Reservation`.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub site: String,
    pub resource_type: ResourceType,
    pub capacities: Capacities,
    pub components: Vec<ComponentRequest>,
}

/// One requested network-service sliver, referencing the node requests that
/// own the interfaces it attaches to (spec §4.6 pass 2).
#[derive(Debug, Clone)]
pub struct NetworkServiceRequest {
    pub resource_type: ResourceType,
    pub bandwidth_gbps: u32,
    /// Peak rate allowed above `bandwidth_gbps`, carried through to the
    /// broker as an opaque property (spec §4.6 "burst (Mbits)").
    pub burst_mbits: u32,
    pub parent_node_indices: Vec<usize>,
    /// Interface sliver name on the peer side of the connection, and the
    /// network-service id it belongs to — captured into the node-map so the
    /// broker can walk to the peer connection point (spec §4.4).
    pub peer_ifs: String,
    pub peer_ns_id: String,
    /// Component name of the interface sliver on the parent node.
    pub parent_component_name: String,
    /// Dedicated NICs draw a fresh VLAN from the connection point; shared
    /// NICs reuse the VLAN the orchestrator already set on the parent sliver.
    pub dedicated_nic: bool,
}

/// Minimal in-repo stand-in for the ASM the orchestrator would otherwise
/// load from the external graph information-model library (out of scope,
/// spec §1).
#[derive(Debug, Clone, Default)]
pub struct RequestGraph {
    pub nodes: Vec<NodeRequest>,
    pub services: Vec<NetworkServiceRequest>,
}

pub struct OrchestratorPolicy {
    pub max_lease_duration: chrono::Duration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        OrchestratorPolicy { max_lease_duration: chrono::Duration::hours(24) }
    }
}

impl OrchestratorPolicy {
    /// Validates and possibly truncates a requested lease end against the
    /// policy cap (spec §8 boundary: "extend beyond the policy cap ->
    /// truncated to cap with a warning").
    pub fn clamp_lease_end(&self, lease_start: DateTime<Utc>, requested_end: DateTime<Utc>) -> DateTime<Utc> {
        let cap = lease_start + self.max_lease_duration;
        if requested_end > cap {
            log::warn!("requested lease end {requested_end} exceeds policy cap; truncating to {cap}");
            cap
        } else {
            requested_end
        }
    }

    /// Walks the request graph in two passes (spec §4.6): node slivers
    /// first, then network-service slivers recording predecessor ids
    /// pointing at the node reservations whose interfaces they attach to.
    /// Every returned reservation starts `Nascent`/pending `Ticketing`.
    pub fn build_slice_reservations(&self, slice: &mut Slice, graph: &RequestGraph, lease_start: DateTime<Utc>, lease_end: DateTime<Utc>) -> Result<Vec<Reservation>, Error> {
        let lease_end = self.clamp_lease_end(lease_start, lease_end);
        let mut reservations = Vec::with_capacity(graph.nodes.len() + graph.services.len());
        let mut node_reservation_ids = Vec::with_capacity(graph.nodes.len());

        for node in &graph.nodes {
            let mut r = Reservation::with_site(slice.id, node.site.clone(), node.resource_type, node.capacities, node.components.clone(), lease_start, lease_end);
            r.validate()?;
            r.properties.insert("demanded".to_string(), "true".to_string());
            r.pending = crate::domain::reservation::PendingState::Ticketing;
            node_reservation_ids.push(r.id);
            slice.add_reservation(r.id);
            reservations.push(r);
        }

        for service in &graph.services {
            let predecessors: Vec<ReservationId> = service.parent_node_indices.iter().filter_map(|i| node_reservation_ids.get(*i).copied()).collect();
            let mut r = Reservation::with_site(
                slice.id,
                String::new(),
                service.resource_type,
                Capacities { bandwidth_gbps: service.bandwidth_gbps, ..Capacities::default() },
                vec![],
                lease_start,
                lease_end,
            );
            r.validate()?;
            r.predecessors = predecessors;
            r.properties.insert("demanded".to_string(), "true".to_string());

            // Node-map: capture (peer_ifs, peer_ns_id, parent_component_name,
            // parent_node_id) on the reservation's properties bag so the
            // broker can walk from the interface sliver to the peer
            // connection point later (spec §4.4, §4.6).
            if let Some(&parent_idx) = service.parent_node_indices.first() {
                if let Some(&parent_rid) = node_reservation_ids.get(parent_idx) {
                    r.properties.insert("parent_node_id".to_string(), parent_rid.to_string());
                }
            }
            r.properties.insert("parent_component_name".to_string(), service.parent_component_name.clone());
            r.properties.insert("peer_ifs".to_string(), service.peer_ifs.clone());
            r.properties.insert("peer_ns_id".to_string(), service.peer_ns_id.clone());
            r.properties.insert("dedicated_nic".to_string(), service.dedicated_nic.to_string());
            r.properties.insert("burst_mbits".to_string(), service.burst_mbits.to_string());

            r.pending = if r.predecessors.is_empty() { crate::domain::reservation::PendingState::Ticketing } else { crate::domain::reservation::PendingState::BlockedRedeem };
            slice.add_reservation(r.id);
            reservations.push(r);
        }

        Ok(reservations)
    }
}

/// Dependency rule (spec §4.2): a predecessor must be at or past `Ticketed`
/// (VLAN/MAC allocations known) for its dependent to advance.
pub fn dependencies_satisfied(reservation: &Reservation, all: &HashMap<ReservationId, Reservation>) -> bool {
    reservation.predecessors.iter().all(|pid| all.get(pid).map(|p| p.state.rank() >= ReservationState::Ticketed.rank() && !p.state.is_terminal()).unwrap_or(false))
}

/// Returns the first predecessor that has failed, if any (used to apply the
/// "predecessor Failed while Blocked" transition).
pub fn failed_predecessor(reservation: &Reservation, all: &HashMap<ReservationId, Reservation>) -> Option<ReservationId> {
    reservation.predecessors.iter().copied().find(|pid| all.get(pid).map(|p| p.state == ReservationState::Failed).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::slice::Owner;
    use chrono::Duration;

    fn owner() -> Owner {
        Owner { user: "alice".into(), project: "p1".into() }
    }

    #[test]
    fn two_pass_build_links_network_service_to_its_node() {
        let now = Utc::now();
        let mut slice = Slice::new("s1", owner(), now, now + Duration::hours(1));
        let graph = RequestGraph {
            nodes: vec![NodeRequest { site: "RENC".into(), resource_type: ResourceType::Vm, capacities: Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 }, components: vec![] }],
            services: vec![NetworkServiceRequest {
                resource_type: ResourceType::L2Bridge,
                bandwidth_gbps: 10,
                burst_mbits: 200,
                parent_node_indices: vec![0],
                peer_ifs: "if-1".into(),
                peer_ns_id: "ns-1".into(),
                parent_component_name: "nic0".into(),
                dedicated_nic: true,
            }],
        };
        let policy = OrchestratorPolicy::default();
        let reservations = policy.build_slice_reservations(&mut slice, &graph, now, now + Duration::hours(1)).unwrap();

        assert_eq!(reservations.len(), 2);
        let node_id = reservations[0].id;
        let service = &reservations[1];
        assert_eq!(service.predecessors, vec![node_id]);
        assert_eq!(service.pending, crate::domain::reservation::PendingState::BlockedRedeem);
        assert_eq!(service.properties.get("parent_node_id"), Some(&node_id.to_string()));
        assert_eq!(service.properties.get("parent_component_name"), Some(&"nic0".to_string()));
        assert_eq!(service.properties.get("peer_ifs"), Some(&"if-1".to_string()));
        assert_eq!(service.properties.get("peer_ns_id"), Some(&"ns-1".to_string()));
        assert_eq!(service.properties.get("dedicated_nic"), Some(&"true".to_string()));
        assert_eq!(service.properties.get("burst_mbits"), Some(&"200".to_string()));
    }

    #[test]
    fn lease_end_beyond_cap_is_truncated() {
        let policy = OrchestratorPolicy { max_lease_duration: Duration::hours(24) };
        let start = Utc::now();
        let requested_end = start + Duration::hours(48);
        let clamped = policy.clamp_lease_end(start, requested_end);
        assert_eq!(clamped, start + Duration::hours(24));
    }

    #[test]
    fn dependency_is_satisfied_once_predecessor_is_ticketed() {
        let mut all = HashMap::new();
        let mut pred = Reservation::new(crate::id::SliceId::new(), ResourceType::Vm, Capacities { cores: 1, ram_gb: 1, disk_gb: 1, bandwidth_gbps: 0 }, vec![], Utc::now(), Utc::now() + Duration::hours(1));
        pred.state = ReservationState::Ticketed;
        let pred_id = pred.id;
        all.insert(pred_id, pred);

        let mut dependent = Reservation::new(crate::id::SliceId::new(), ResourceType::L2Bridge, Capacities { bandwidth_gbps: 10, ..Capacities::default() }, vec![], Utc::now(), Utc::now() + Duration::hours(1));
        dependent.predecessors.push(pred_id);
        assert!(dependencies_satisfied(&dependent, &all));
    }
}
