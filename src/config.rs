//! Configuration management for Tally.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TallyError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::BucketStrategy;

/// Main configuration for the Tally binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How a check talks to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Read the count, then increment if under the limit
    #[default]
    ReadThenIncrement,
    /// Single atomic increment-and-compare
    Strict,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Operations allowed per window
    #[serde(default = "default_max_operations")]
    pub max_operations: i64,

    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Bucketing strategy
    #[serde(default)]
    pub strategy: BucketStrategy,

    /// Check protocol
    #[serde(default)]
    pub mode: CheckMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            period_secs: default_period_secs(),
            strategy: BucketStrategy::default(),
            mode: CheckMode::default(),
        }
    }
}

impl LimiterConfig {
    /// Window length.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

fn default_max_operations() -> i64 {
    100
}

fn default_period_secs() -> u64 {
    60
}

/// Counter store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store
    Memory {
        /// Interval between sweeps of expired counters
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Gossip mesh store
    Mesh(MeshStoreConfig),
    /// Redis store (requires the `redis` feature)
    Redis(RedisStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Gossip mesh store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshStoreConfig {
    /// Node identifier (random if unset)
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers (defaults to `listen_addr`)
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers to bootstrap from
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Interval between sweeps of expired counter shares
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MeshStoreConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MeshStoreConfig {
    /// Build the cluster configuration for this node.
    pub fn cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tally".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_sweep_interval() -> u64 {
    30
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_prefix() -> String {
    "tally".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TallyConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::Configuration(format!("Failed to parse config: {}", e)))
    }
}
