use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::reservation::{Capacities, ResourceType};
use crate::id::GraphNodeId;

/// A peer connection point on a node: the label delegation a dedicated-NIC
/// network service draws its VLAN from (spec §4.4 network-service branch).
/// Keyed by the parent node's component name on `GraphNode::connection_points`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionPoint {
    pub vlan_pool: Vec<u16>,
}

/// One node of a substrate/combined/request graph: a minimal in-repo stand-in
/// for the external graph information-model library (out of scope per spec
/// §1). Tracks just enough to drive broker/authority first-fit allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: GraphNodeId,
    pub site: String,
    pub resource_type: ResourceType,
    pub total_capacity: Capacities,
    /// model -> total units present on this node.
    pub components: HashMap<String, u32>,
    /// Free VLAN tags available for allocation from this node's label pool.
    pub vlan_pool: Vec<u16>,
    /// Free MAC addresses available for shared-NIC allocation.
    pub mac_pool: Vec<String>,
    /// Per-component-name peer connection points, consulted when a
    /// dedicated-NIC network service needs its own VLAN (spec §4.4).
    pub connection_points: HashMap<String, ConnectionPoint>,
}

impl GraphNode {
    pub fn new(site: impl Into<String>, resource_type: ResourceType, total_capacity: Capacities) -> Self {
        GraphNode {
            id: GraphNodeId::new(),
            site: site.into(),
            resource_type,
            total_capacity,
            components: HashMap::new(),
            vlan_pool: Vec::new(),
            mac_pool: Vec::new(),
            connection_points: HashMap::new(),
        }
    }

    pub fn with_component(mut self, model: impl Into<String>, count: u32) -> Self {
        self.components.insert(model.into(), count);
        self
    }

    pub fn with_vlan_pool(mut self, vlans: Vec<u16>) -> Self {
        self.vlan_pool = vlans;
        self
    }

    pub fn with_mac_pool(mut self, macs: Vec<String>) -> Self {
        self.mac_pool = macs;
        self
    }

    pub fn with_connection_point(mut self, component_name: impl Into<String>, vlan_pool: Vec<u16>) -> Self {
        self.connection_points.insert(component_name.into(), ConnectionPoint { vlan_pool });
        self
    }

    /// Does this node have at least as many units of each requested
    /// component model as `requested`?
    pub fn has_free_components(&self, requested: &[super::reservation::ComponentRequest], already_allocated: &[super::reservation::ComponentRequest]) -> bool {
        requested.iter().all(|req| {
            let total = self.components.get(&req.model).copied().unwrap_or(0);
            let used: u32 = already_allocated.iter().filter(|c| c.model == req.model).map(|c| c.count).sum();
            total.saturating_sub(used) >= req.count
        })
    }
}

/// A graph model is the CBM at a broker, the ARM at an authority, or the ASM
/// at an orchestrator; all three share this representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphModel {
    nodes: HashMap<GraphNodeId, GraphNode>,
}

impl GraphModel {
    pub fn new() -> Self {
        GraphModel::default()
    }

    pub fn insert(&mut self, node: GraphNode) -> GraphNodeId {
        let id = node.id;
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: GraphNodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: GraphNodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&id)
    }

    /// Nodes of type `resource_type` at `site`, in ascending node-id order
    /// (spec §4.4 step 3's default deterministic iteration order).
    pub fn nodes_of_type_at_site(&self, resource_type: ResourceType, site: &str) -> Vec<&GraphNode> {
        let mut matches: Vec<&GraphNode> = self.nodes.values().filter(|n| n.resource_type == resource_type && n.site == site).collect();
        matches.sort_by_key(|n| n.id);
        matches
    }
}
