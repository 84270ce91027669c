use serde::{Deserialize, Serialize};

use crate::config::{ActorType, PeerConfig};
use crate::id::ActorGuid;

/// A known remote actor. Loaded once at init from `peers` config and never
/// mutated at runtime (spec §3 "Peer").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub guid: ActorGuid,
    pub actor_type: ActorType,
    pub inbound_topic: String,
    pub delegation_name: Option<String>,
}

/// Process-wide catalog of peers, built once from config.
#[derive(Debug, Clone, Default)]
pub struct PeerCatalog {
    peers: Vec<Peer>,
}

impl PeerCatalog {
    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let peers = peers
            .iter()
            .map(|p| Peer {
                guid: ActorGuid::from_uuid(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, p.guid.as_bytes())),
                actor_type: p.actor_type,
                inbound_topic: p.topic.clone(),
                delegation_name: p.delegation.clone(),
            })
            .collect();
        PeerCatalog { peers }
    }

    pub fn by_type(&self, actor_type: ActorType) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(move |p| p.actor_type == actor_type)
    }

    pub fn find(&self, guid: ActorGuid) -> Option<&Peer> {
        self.peers.iter().find(|p| p.guid == guid)
    }

    pub fn all(&self) -> &[Peer] {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_filters_by_actor_type() {
        let cfg = vec![
            PeerConfig { guid: "broker-1".into(), actor_type: ActorType::Broker, topic: "broker-1-in".into(), delegation: None },
            PeerConfig { guid: "authority-1".into(), actor_type: ActorType::Authority, topic: "auth-1-in".into(), delegation: None },
        ];
        let catalog = PeerCatalog::from_config(&cfg);
        assert_eq!(catalog.by_type(ActorType::Broker).count(), 1);
        assert_eq!(catalog.all().len(), 2);
    }
}
