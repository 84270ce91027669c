use slotmap::{DefaultKey, SlotMap};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::{Delegation, Reservation, Slice};
use crate::error::{Error, Result};
use crate::id::{DelegationId, ReservationId, SliceId};

/// A consistent point-in-time copy of store contents, handed to concurrent
/// read queries (e.g. a REST status call) so they never read torn state from
/// live kernel memory (spec §5 "Shared-resource policy").
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub slices: Vec<Slice>,
    pub reservations: Vec<Reservation>,
    pub delegations: Vec<Delegation>,
}

/// Durable reservation/slice/delegation store with transactional
/// batch-commit and replay-on-restart semantics (spec §4.1, §5, §8). The
/// kernel is the only writer; it calls `commit` once per tick with the
/// batch of entities that changed since the last commit.
pub trait Store: Send + Sync {
    fn commit(&self, batch: &CommitBatch) -> Result<()>;
    fn snapshot(&self) -> Result<StoreSnapshot>;
    fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;
}

/// One transactional write: everything in a batch is applied atomically or
/// not at all, matching "the persistent store uses transactional writes
/// (one transaction per batch-commit)".
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub slices: Vec<Slice>,
    pub reservations: Vec<Reservation>,
    pub delegations: Vec<Delegation>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty() && self.reservations.is_empty() && self.delegations.is_empty()
    }
}

/// Arena-backed entity table: a `slotmap` holds the entities by an opaque
/// key while a secondary `HashMap` maps the entity's stable `Id<T>` to that
/// key. This is the redesign-flag answer to "cyclic graphs of reservations
/// <-> slices <-> delegations": cross-references are ids looked up in the
/// arena, never direct pointers (spec §9).
struct Arena<K, V> {
    slots: SlotMap<DefaultKey, V>,
    index: HashMap<K, DefaultKey>,
}

impl<K: std::hash::Hash + Eq + Copy, V> Arena<K, V> {
    fn new() -> Self {
        Arena { slots: SlotMap::new(), index: HashMap::new() }
    }

    fn upsert(&mut self, id: K, value: V) {
        if let Some(&key) = self.index.get(&id) {
            self.slots[key] = value;
        } else {
            let key = self.slots.insert(value);
            self.index.insert(id, key);
        }
    }

    fn get(&self, id: K) -> Option<&V> {
        self.index.get(&id).and_then(|key| self.slots.get(*key))
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.values()
    }
}

struct MemStoreInner {
    slices: Arena<SliceId, Slice>,
    reservations: Arena<ReservationId, Reservation>,
    delegations: Arena<DelegationId, Delegation>,
}

/// In-memory `Store` implementation used by tests and the bundled demo
/// (`database.url = "memory://"`). A SQL-backed adapter would implement the
/// same `Store` trait; see DESIGN.md for why that adapter itself is out of
/// scope for this crate.
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: RwLock::new(MemStoreInner { slices: Arena::new(), reservations: Arena::new(), delegations: Arena::new() }),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn commit(&self, batch: &CommitBatch) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        for slice in &batch.slices {
            inner.slices.upsert(slice.id, slice.clone());
        }
        for reservation in &batch.reservations {
            inner.reservations.upsert(reservation.id, reservation.clone());
        }
        for delegation in &batch.delegations {
            inner.delegations.upsert(delegation.id, delegation.clone());
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let inner = self.inner.read().map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        Ok(StoreSnapshot {
            slices: inner.slices.values().cloned().collect(),
            reservations: inner.reservations.values().cloned().collect(),
            delegations: inner.delegations.values().cloned().collect(),
        })
    }

    fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let inner = self.inner.read().map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        Ok(inner.reservations.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reservation::{Capacities, ResourceType};
    use chrono::{Duration, Utc};

    fn sample_reservation() -> Reservation {
        Reservation::new(
            SliceId::new(),
            ResourceType::Vm,
            Capacities { cores: 4, ram_gb: 64, disk_gb: 500, bandwidth_gbps: 0 },
            vec![],
            Utc::now(),
            Utc::now() + Duration::hours(1),
        )
    }

    #[test]
    fn commit_then_snapshot_round_trips_a_reservation() {
        let store = MemStore::new();
        let r = sample_reservation();
        let batch = CommitBatch { reservations: vec![r.clone()], ..Default::default() };
        store.commit(&batch).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.reservations.len(), 1);
        assert_eq!(snap.reservations[0].id, r.id);
    }

    #[test]
    fn re_committing_the_same_id_overwrites_rather_than_duplicates() {
        let store = MemStore::new();
        let mut r = sample_reservation();
        store.commit(&CommitBatch { reservations: vec![r.clone()], ..Default::default() }).unwrap();
        r.retry_count = 3;
        store.commit(&CommitBatch { reservations: vec![r.clone()], ..Default::default() }).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.reservations.len(), 1);
        assert_eq!(snap.reservations[0].retry_count, 3);
    }

    #[test]
    fn replay_after_restart_sees_the_last_committed_state() {
        let store = MemStore::new();
        let r = sample_reservation();
        store.commit(&CommitBatch { reservations: vec![r.clone()], ..Default::default() }).unwrap();
        // Simulate "restart": a fresh handle reading the same backing store
        // would hydrate from `snapshot()`; here we assert the snapshot alone
        // is sufficient to reconstruct the reservation by id.
        let reloaded = store.load_reservation(r.id).unwrap().expect("reservation should survive commit");
        assert_eq!(reloaded.id, r.id);
    }
}
