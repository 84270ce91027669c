use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// A UUID tagged with a phantom marker type so ids for different entities
/// (slices, reservations, delegations, peers, messages) cannot be mixed up
/// at compile time despite all being newtype wrappers over `Uuid`.
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    inner: Uuid,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub fn new() -> Self {
        Id { inner: Uuid::new_v4(), _marker: PhantomData }
    }

    pub fn from_uuid(inner: Uuid) -> Self {
        Id { inner, _marker: PhantomData }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}
impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.cmp(&other.inner)
    }
}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Marker types for `Id<T>`. These are never constructed; they only exist
/// to make `Id<SliceTag>` and `Id<ReservationTag>` distinct types.
pub struct SliceTag;
pub struct ReservationTag;
pub struct DelegationTag;
pub struct PeerTag;
pub struct MsgTag;
pub struct GraphNodeTag;

pub type SliceId = Id<SliceTag>;
pub type ReservationId = Id<ReservationTag>;
pub type DelegationId = Id<DelegationTag>;
pub type ActorGuid = Id<PeerTag>;
pub type MsgId = Id<MsgTag>;
pub type GraphNodeId = Id<GraphNodeTag>;
