use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::reservation::Capacities;
use crate::error::Error;
use crate::id::{ActorGuid, DelegationId, GraphNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationState {
    Nascent,
    Delegated,
    Reclaimed,
    Closed,
}

/// A signed statement that `target` may arbitrate a subset of `source`'s
/// substrate (ARM) or cluster (CBM). See spec §3 "Delegation".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub source_actor_guid: ActorGuid,
    pub target_actor_guid: ActorGuid,
    pub graph_id: GraphNodeId,
    pub state: DelegationState,
    /// Per graph-node capacity this delegation grants.
    pub node_capacities: HashMap<GraphNodeId, Capacities>,
}

impl Delegation {
    pub fn new(source_actor_guid: ActorGuid, target_actor_guid: ActorGuid, graph_id: GraphNodeId) -> Self {
        Delegation {
            id: DelegationId::new(),
            source_actor_guid,
            target_actor_guid,
            graph_id,
            state: DelegationState::Nascent,
            node_capacities: HashMap::new(),
        }
    }

    pub fn delegate(&mut self, node: GraphNodeId, capacity: Capacities) {
        self.node_capacities.insert(node, capacity);
        self.state = DelegationState::Delegated;
    }

    pub fn delegated_capacity(&self, node: GraphNodeId) -> Capacities {
        if self.state != DelegationState::Delegated {
            return Capacities::default();
        }
        self.node_capacities.get(&node).copied().unwrap_or_default()
    }

    /// Open Question #3 resolution: `reclaim` is illegal while any
    /// reservation still holds capacity on this delegation's nodes.
    pub fn reclaim(&mut self, holdings: &Capacities) -> Result<(), Error> {
        if !holdings.is_zero() {
            return Err(Error::InvalidRequest("cannot reclaim a delegation with active holdings".to_string()));
        }
        self.state = DelegationState::Reclaimed;
        self.node_capacities.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = DelegationState::Closed;
    }
}
