use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::reservation::{Reservation, ResourceType};
use crate::error::Error;

/// Outcome of a substrate provisioning (or teardown) invocation. Authorities
/// invoke this after a reservation is redeemed (spec §1, §4.5); the handler
/// itself is an external collaborator and out of scope, but the call shape
/// is part of the core.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub ok: bool,
    pub properties: HashMap<String, String>,
    pub error: Option<Error>,
}

impl HandlerOutcome {
    pub fn success(properties: HashMap<String, String>) -> Self {
        HandlerOutcome { ok: true, properties, error: None }
    }
    pub fn failure(error: Error) -> Self {
        HandlerOutcome { ok: false, properties: HashMap::new(), error: Some(error) }
    }
}

/// A substrate provisioning handler for one resource type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn provision(&self, reservation: &Reservation) -> HandlerOutcome;
    async fn teardown(&self, reservation: &Reservation) -> HandlerOutcome;
    /// Restart-recovery safety probe (spec §8 scenario 6): asks the handler
    /// whether the substrate-side object it would have created already
    /// exists, so a reservation recovered mid-`Priming` can tell a still-in-
    /// flight provision from one whose completion was lost with the crash.
    async fn is_deleted(&self, reservation: &Reservation) -> bool;
}

/// Compile-time registry of handler implementations keyed by resource-type
/// string (spec §9 redesign flag: no dynamic class loading). `actor.controls`
/// config maps resource-type names to registry keys at startup; this registry
/// is populated once and never mutated.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(key.into(), handler);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(key).cloned()
    }

    /// Resolves a reservation's resource type to a handler via the
    /// `actor.controls.resources` config map (type name -> registry key).
    pub fn resolve(&self, resource_type: ResourceType, resource_map: &HashMap<String, String>) -> Option<Arc<dyn Handler>> {
        let type_name = format!("{:?}", resource_type);
        let key = resource_map.get(&type_name)?;
        self.get(key)
    }
}

/// A handler that always succeeds immediately, returning a synthetic
/// instance id. Used by the bundled demo and by tests that don't exercise
/// handler-failure paths.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn provision(&self, reservation: &Reservation) -> HandlerOutcome {
        let mut properties = HashMap::new();
        properties.insert("instance_id".to_string(), format!("noop-{}", reservation.id));
        HandlerOutcome::success(properties)
    }

    async fn teardown(&self, _reservation: &Reservation) -> HandlerOutcome {
        HandlerOutcome::success(HashMap::new())
    }

    async fn is_deleted(&self, _reservation: &Reservation) -> bool {
        false
    }
}
