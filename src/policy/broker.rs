use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::calendar::Calendar;
use crate::clock::Tick;
use crate::config::ActorControls;
use crate::domain::delegation::Delegation;
use crate::domain::graph::GraphModel;
use crate::domain::reservation::{Capacities, NodeMap, Reservation};
use crate::error::Error;
use crate::id::{DelegationId, GraphNodeId, ReservationId, SliceId};

/// First-fit allocation over capacity and component delegations
/// (spec §4.4). One `BrokerPolicy` per broker actor, built from its
/// `actor.controls` config.
pub struct BrokerPolicy {
    controls: ActorControls,
}

impl BrokerPolicy {
    pub fn new(controls: ActorControls) -> Self {
        BrokerPolicy { controls }
    }

    fn candidate_order<'a>(&self, tick: Tick, slice_id: SliceId, site: &str, mut nodes: Vec<&'a crate::domain::graph::GraphNode>) -> Vec<&'a crate::domain::graph::GraphNode> {
        if self.controls.is_random_site(site) {
            // Open Question #2 resolution: seed from (tick, slice_id) so a
            // single slice's retries within the same tick see a stable
            // order, while different slices (or later ticks) may reorder.
            let mut hasher = DefaultHasher::new();
            tick.hash(&mut hasher);
            slice_id.hash(&mut hasher);
            let seed = hasher.finish();
            let mut rng = StdRng::seed_from_u64(seed);
            nodes.shuffle(&mut rng);
        }
        // Nodes are already ascending by id from `GraphModel::nodes_of_type_at_site`;
        // the `Random` branch above is the only thing allowed to reorder them.
        nodes
    }

    fn delegated_capacity(delegations: &HashMap<DelegationId, Delegation>, node: GraphNodeId) -> Capacities {
        delegations.values().fold(Capacities::default(), |acc, d| acc.saturating_add(&d.delegated_capacity(node)))
    }

    /// Allocates one reservation against the broker's CBM. Idempotent: a
    /// reservation that already has a `node_map` is re-validated against
    /// that same node rather than recomputed (spec §4.4 "Idempotence"), and
    /// a holding already present for this reservation is never added twice.
    pub fn allocate_ticket(
        &self,
        graph: &GraphModel,
        calendar: &mut Calendar,
        delegations: &HashMap<DelegationId, Delegation>,
        reservation: &mut Reservation,
        cbm_graph_id: GraphNodeId,
        tick: Tick,
        all_reservations: &HashMap<ReservationId, Reservation>,
    ) -> Result<(), Error> {
        reservation.validate()?;

        if reservation.resource_type.is_network_service() {
            return self.allocate_network_service(graph, calendar, reservation, all_reservations);
        }

        let candidates: Vec<&crate::domain::graph::GraphNode> = if let Some(existing) = reservation.node_map {
            graph.get(existing.graph_node_id).into_iter().collect()
        } else {
            let nodes = graph.nodes_of_type_at_site(reservation.resource_type, &reservation.site);
            self.candidate_order(tick, reservation.slice_id, &reservation.site, nodes)
        };

        for node in candidates {
            let committed = calendar.committed_over_excluding(node.id, reservation.lease_start, reservation.lease_end, reservation.id);
            let delegated = Self::delegated_capacity(delegations, node.id);
            let limit = Capacities {
                cores: (delegated.cores as f64 * self.controls.oversubscription_factor) as u32,
                ram_gb: (delegated.ram_gb as f64 * self.controls.oversubscription_factor) as u32,
                disk_gb: (delegated.disk_gb as f64 * self.controls.oversubscription_factor) as u32,
                bandwidth_gbps: (delegated.bandwidth_gbps as f64 * self.controls.oversubscription_factor) as u32,
            };
            let available = limit.saturating_sub(&committed);

            if reservation.requested.le(&available) && node.has_free_components(&reservation.requested_components, &reservation.allocated_components) {
                reservation.node_map = Some(NodeMap { graph_id: cbm_graph_id, graph_node_id: node.id });
                reservation.approved = reservation.requested;
                reservation.allocated_components = reservation.requested_components.clone();

                if let Some(shared_nic) = reservation.requested_components.iter().find(|c| c.model == "SharedNIC") {
                    let _ = shared_nic;
                    if let Some(vlan) = node.vlan_pool.first() {
                        reservation.properties.insert("vlan_tag".to_string(), vlan.to_string());
                    }
                    if let Some(mac) = node.mac_pool.first() {
                        reservation.properties.insert("mac_address".to_string(), mac.clone());
                    }
                }

                if !calendar.has_holding(node.id, reservation.id) {
                    calendar.add_holding(node.id, reservation.id, reservation.lease_start, reservation.lease_end, reservation.approved);
                }
                return Ok(());
            }
        }

        Err(Error::InsufficientResources(format!("no candidate node at site {} satisfies the request", reservation.site)))
    }

    /// spec §4.4 "For network-service slivers, steps differ": rather than
    /// first-fit over node capacity, the broker walks the interface sliver
    /// to the parent node reservation's node-map, looks up the peer
    /// connection point on its own CBM, and — for dedicated NICs only —
    /// allocates a VLAN from that connection point's label delegation. A
    /// shared NIC already has its VLAN set by the orchestrator on the parent
    /// node sliver; the broker only propagates the mapping.
    fn allocate_network_service(&self, graph: &GraphModel, calendar: &mut Calendar, reservation: &mut Reservation, all_reservations: &HashMap<ReservationId, Reservation>) -> Result<(), Error> {
        let parent_id_str = reservation
            .properties
            .get("parent_node_id")
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("network-service reservation missing parent_node_id".to_string()))?;
        let parent_uuid = uuid::Uuid::parse_str(&parent_id_str).map_err(|_| Error::InvalidRequest("malformed parent_node_id".to_string()))?;
        let parent_id: ReservationId = ReservationId::from_uuid(parent_uuid);
        let parent = all_reservations.get(&parent_id).ok_or_else(|| Error::InvalidRequest("parent node reservation not found".to_string()))?;
        let parent_node_map = parent.node_map.ok_or_else(|| Error::InvalidRequest("parent node reservation has no node_map yet".to_string()))?;

        let dedicated = reservation.properties.get("dedicated_nic").map(|v| v == "true").unwrap_or(false);
        let component_name = reservation.properties.get("parent_component_name").cloned().unwrap_or_default();

        if dedicated {
            let node = graph.get(parent_node_map.graph_node_id).ok_or_else(|| Error::InvalidRequest("connection point node not found in CBM".to_string()))?;
            let vlan = node
                .connection_points
                .get(&component_name)
                .and_then(|cp| cp.vlan_pool.first().copied())
                .ok_or_else(|| Error::InsufficientResources(format!("no VLAN available on connection point {component_name}")))?;
            reservation.properties.insert("vlan_tag".to_string(), vlan.to_string());
        } else if let Some(vlan) = parent.properties.get("vlan_tag").cloned() {
            reservation.properties.insert("vlan_tag".to_string(), vlan);
        }

        reservation.node_map = Some(parent_node_map);
        reservation.approved = reservation.requested;
        if !calendar.has_holding(parent_node_map.graph_node_id, reservation.id) {
            calendar.add_holding(parent_node_map.graph_node_id, reservation.id, reservation.lease_start, reservation.lease_end, reservation.approved);
        }
        Ok(())
    }

    /// Re-validates an extended lease window against the broker's CBM and,
    /// if it still fits, swaps the holding in place (spec §4.6 renewal:
    /// ExtendTicket is the broker-side half of extend-then-swap). Uses the
    /// reservation's already-assigned `node_map` rather than first-fit —
    /// extend never relocates a reservation to a different node.
    pub fn extend(&self, calendar: &mut Calendar, delegations: &HashMap<DelegationId, Delegation>, reservation: &mut Reservation, new_lease_end: chrono::DateTime<chrono::Utc>) -> Result<(), Error> {
        let node_map = reservation.node_map.ok_or_else(|| Error::InvalidRequest("extend requires an existing node_map".to_string()))?;

        let committed = calendar.committed_over_excluding(node_map.graph_node_id, reservation.lease_start, new_lease_end, reservation.id);
        let delegated = Self::delegated_capacity(delegations, node_map.graph_node_id);
        let limit = Capacities {
            cores: (delegated.cores as f64 * self.controls.oversubscription_factor) as u32,
            ram_gb: (delegated.ram_gb as f64 * self.controls.oversubscription_factor) as u32,
            disk_gb: (delegated.disk_gb as f64 * self.controls.oversubscription_factor) as u32,
            bandwidth_gbps: (delegated.bandwidth_gbps as f64 * self.controls.oversubscription_factor) as u32,
        };
        let available = limit.saturating_sub(&committed);

        if !reservation.approved.le(&available) {
            return Err(Error::InsufficientResources(format!("extended lease window no longer fits at node {}", node_map.graph_node_id)));
        }

        calendar.remove_holding(node_map.graph_node_id, reservation.id);
        calendar.add_holding(node_map.graph_node_id, reservation.id, reservation.lease_start, new_lease_end, reservation.approved);
        Ok(())
    }
}
