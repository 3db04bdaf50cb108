//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and counter gossip for the mesh store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Prefix of every counter key written into the node state.
const COUNTER_PREFIX: &str = "counter|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tally".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// One node's share of a counter, as stored in the gossip state.
///
/// Format: "{count}@{expires_at_unix_ms}"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterShare {
    /// Increments recorded by the owning node.
    pub count: i64,
    /// Wall-clock expiry in unix milliseconds.
    pub expires_at_ms: i64,
}

impl CounterShare {
    /// Encode for the chitchat key-value state.
    pub fn encode(&self) -> String {
        format!("{}@{}", self.count, self.expires_at_ms)
    }

    /// Parse a value previously produced by [`CounterShare::encode`].
    pub fn decode(value: &str) -> Option<Self> {
        let (count, expires) = value.split_once('@')?;
        Some(Self {
            count: count.parse().ok()?,
            expires_at_ms: expires.parse().ok()?,
        })
    }

    fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Convert a bucket key to a chitchat key string.
///
/// Format: "counter|{bucket_key}"
pub fn chitchat_key(bucket_key: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, bucket_key)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Expiry (unix ms) of every counter this node has written.
    local_keys: DashMap<String, i64>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("local_keys", &self.local_keys.len())
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
            local_keys: DashMap::new(),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Add one to our share of a counter and return the total across all nodes.
    ///
    /// Our share restarts at zero if it had expired, and its expiry is reset
    /// to `ttl` from now. The chitchat lock serializes increments made
    /// through this node.
    pub async fn increment_counter(&self, bucket_key: &str, ttl: Duration) -> i64 {
        let key = chitchat_key(bucket_key);
        let now = now_ms();
        let expires_at_ms = now.saturating_add(ttl.as_millis() as i64);

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local = chitchat
            .self_node_state()
            .get(&key)
            .and_then(CounterShare::decode)
            .filter(|share| share.is_live(now))
            .map(|share| share.count)
            .unwrap_or(0);

        let share = CounterShare {
            count: current_local + 1,
            expires_at_ms,
        };
        chitchat.self_node_state().set(&key, share.encode());
        self.local_keys.insert(key.clone(), expires_at_ms);

        debug!(
            key = %key,
            local_value = share.count,
            "Incremented local counter"
        );

        Self::sum_counter(&chitchat, &key, now)
    }

    /// Get the total live count for a bucket key across all nodes.
    pub async fn get_count(&self, bucket_key: &str) -> i64 {
        let key = chitchat_key(bucket_key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::sum_counter(&chitchat, &key, now_ms())
    }

    /// Delete our expired counter shares from the gossip state.
    ///
    /// Returns the number of keys removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .local_keys
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut removed = 0;
        for key in expired {
            // Re-check under the lock; the key may have been refreshed since.
            if self.local_keys.remove_if(&key, |_, expires| *expires <= now).is_some() {
                chitchat.self_node_state().delete(&key);
                removed += 1;
            }
        }

        debug!(removed = removed, "Deleted expired counter shares");
        removed
    }

    /// Sum live shares of a counter across all live nodes (including ourselves).
    fn sum_counter(chitchat: &chitchat::Chitchat, key: &str, now: i64) -> i64 {
        let mut total: i64 = 0;

        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(share) = node_state.get(key).and_then(CounterShare::decode) {
                    if share.is_live(now) && share.count > 0 {
                        total += share.count;
                    }
                }
            }
        }

        total
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
