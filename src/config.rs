use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Which of the three actor roles a process is configured to run as.
/// Selects which message kinds are accepted and which policy modules load
/// (spec §9 redesign flag: one concrete kernel, tagged role, not a class
/// hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Orchestrator,
    Broker,
    Authority,
}

impl Default for ActorType {
    fn default() -> Self {
        ActorType::Orchestrator
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default)]
    pub schema_registry_url: Option<String>,
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: usize,
    #[serde(default = "default_rpc_retries")]
    pub rpc_retries: u32,
    #[serde(default = "default_rpc_timeout_seconds")]
    pub rpc_request_timeout_seconds: u64,
    #[serde(default = "default_consumer_poll_timeout_ms")]
    pub consumer_poll_timeout_ms: u64,
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: usize,
    #[serde(default)]
    pub enable_auto_commit: bool,
    #[serde(default)]
    pub group_id: Option<String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}
fn default_message_max_bytes() -> usize {
    3 * 1024 * 1024
}
fn default_rpc_retries() -> u32 {
    5
}
fn default_rpc_timeout_seconds() -> u64 {
    900
}
fn default_consumer_poll_timeout_ms() -> u64 {
    1000
}
fn default_commit_batch_size() -> usize {
    1
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            bootstrap_servers: default_bootstrap_servers(),
            schema_registry_url: None,
            message_max_bytes: default_message_max_bytes(),
            rpc_retries: default_rpc_retries(),
            rpc_request_timeout_seconds: default_rpc_timeout_seconds(),
            consumer_poll_timeout_ms: default_consumer_poll_timeout_ms(),
            commit_batch_size: default_commit_batch_size(),
            enable_auto_commit: false,
            group_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_cycle_millis")]
    pub cycle_millis: i64,
    #[serde(default)]
    pub first_tick: u64,
    #[serde(default)]
    pub manual: bool,
}

fn default_cycle_millis() -> i64 {
    1000
}

impl Default for TimeConfig {
    fn default() -> Self {
        TimeConfig { start_time: None, cycle_millis: default_cycle_millis(), first_tick: 0, manual: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorControls {
    /// Broker sites where first-fit iteration order is seeded by
    /// `(tick, slice_id)` instead of ascending node id.
    #[serde(default)]
    pub random_sites: Vec<String>,
    /// Per-authority knob (Open Question #1): how far beyond delegated
    /// capacity the broker may grant. `1.0` means no oversubscription.
    #[serde(default = "default_oversubscription_factor")]
    pub oversubscription_factor: f64,
    /// resource type -> handler module key (compile-time registry, spec §9).
    #[serde(default)]
    pub resources: HashMap<String, String>,
    /// Bounded concurrency of the authority's provisioning pool.
    #[serde(default = "default_provisioning_pool_size")]
    pub provisioning_pool_size: usize,
}

fn default_oversubscription_factor() -> f64 {
    1.0
}
fn default_provisioning_pool_size() -> usize {
    4
}

impl ActorControls {
    pub fn is_random_site(&self, site: &str) -> bool {
        self.random_sites.iter().any(|s| s == site)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    pub guid: String,
    pub actor_type: ActorType,
    pub topic: String,
    #[serde(default)]
    pub delegation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdpConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "memory://".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub actor_type: ActorType,
    pub actor_guid: String,
    #[serde(default)]
    pub actor_controls: ActorControls,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub pdp: PdpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub graph_store: GraphStoreConfig,
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_prometheus_port() -> u16 {
    9184
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(Error::from)
    }

    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
