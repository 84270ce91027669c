pub mod bus;
pub mod codec;
pub mod messages;

pub use bus::{Bus, InMemoryBus};
pub use codec::EnvelopeCodec;
pub use messages::{Envelope, MessageBody, QueryLevel};
