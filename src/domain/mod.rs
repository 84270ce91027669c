pub mod delegation;
pub mod graph;
pub mod peer;
pub mod reservation;
pub mod slice;

pub use delegation::{Delegation, DelegationState};
pub use graph::{GraphModel, GraphNode};
pub use peer::Peer;
pub use reservation::{PendingState, Reservation, ReservationState, ResourceType};
pub use slice::{Slice, SliceState};
