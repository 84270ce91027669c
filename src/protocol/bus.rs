use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::messages::Envelope;
use crate::error::Error;

/// An at-least-once, per-topic-ordered message bus between named topics —
/// the in-repo stand-in for the Kafka/Avro transport the spec puts out of
/// scope (spec §1, §6). A production deployment swaps in a Kafka-backed
/// `Bus`; callers only ever see this trait.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), Error>;

    /// Registers a channel that receives every envelope published to
    /// `topic` from this point forward, in publish order.
    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope>;
}

/// In-process bus backing tests and single-process demos. Each topic is an
/// independent FIFO fanned out to every current subscriber; "at-least-once"
/// is satisfied trivially since delivery is a direct, unbounded channel send
/// with no drop path.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus::default()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), Error> {
        let mut subs = self.subscribers.lock().map_err(|_| Error::Internal("bus subscriber lock poisoned".to_string()))?;
        let senders = subs.entry(topic.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        for sender in senders.iter() {
            // An unbounded channel send only fails if the receiver was
            // dropped; `retain` above already filters those out, but a race
            // is harmless here since it degrades to a dropped message for a
            // subscriber that is in the process of going away.
            let _ = sender.send(envelope.clone());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().expect("bus subscriber lock poisoned");
        subs.entry(topic.to_string()).or_default().push(tx);
        rx
    }
}
