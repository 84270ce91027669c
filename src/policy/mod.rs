pub mod authority;
pub mod broker;
pub mod orchestrator;

pub use authority::AuthorityPolicy;
pub use broker::BrokerPolicy;
pub use orchestrator::{NetworkServiceRequest, NodeRequest, OrchestratorPolicy, RequestGraph};
