pub mod store;

pub use store::{MemStore, Store};
