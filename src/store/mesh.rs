//! Counter store shared across a chitchat gossip mesh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{AtomicStore, Store, StoreError};
use crate::mesh::{Cluster, ClusterConfig};

/// Store backed by the gossip cluster.
///
/// Increments are atomic per node; totals seen by a node lag other nodes'
/// increments by roughly one gossip round. Expiry compares wall clocks, so
/// nodes are expected to run with synchronized clocks.
#[derive(Debug, Clone)]
pub struct MeshStore {
    cluster: Arc<Cluster>,
}

impl MeshStore {
    /// Wrap a running cluster node.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// Start a cluster node and wrap it.
    pub async fn start(config: ClusterConfig) -> Result<Self, StoreError> {
        let cluster = Cluster::start(config).await?;
        Ok(Self::new(Arc::new(cluster)))
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Spawn a task deleting this node's expired shares every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cluster = Arc::clone(&self.cluster);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cluster.sweep_expired().await;
            }
        })
    }
}

#[async_trait]
impl Store for MeshStore {
    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.cluster.get_count(key).await)
    }

    async fn add_one(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.cluster.increment_counter(key, ttl).await;
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for MeshStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        Ok(self.cluster.increment_counter(key, ttl).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_mesh_store_counts() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            let ttl = Duration::from_secs(60);

            assert_eq!(store.get("login_5").await.unwrap(), 0);
            store.add_one("login_5", ttl).await.unwrap();
            assert_eq!(store.get("login_5").await.unwrap(), 1);
            assert_eq!(store.increment("login_5", ttl).await.unwrap(), 2);
        }

        // Cleanup - store dropped, so we can unwrap
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_limiters_share_quota_across_nodes() {
        use crate::ratelimit::ManualClock;
        use crate::FixedWindowRateLimiter;

        let cluster1 = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());
        let mut config2 = test_cluster_config(18949);
        config2.seed_nodes = vec!["127.0.0.1:18948".to_string()];
        let cluster2 = Arc::new(Cluster::start(config2).await.unwrap());

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        {
            // Both nodes stay in one window regardless of when the test runs
            let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
            let period = Duration::from_secs(3600);
            let limiter1 =
                FixedWindowRateLimiter::new(3, period, Arc::new(MeshStore::new(cluster1.clone())))
                    .unwrap()
                    .with_clock(clock.clone());
            let limiter2 =
                FixedWindowRateLimiter::new(3, period, Arc::new(MeshStore::new(cluster2.clone())))
                    .unwrap()
                    .with_clock(clock);

            assert!(!limiter1.limit_exceeded("export").await.unwrap());
            assert!(!limiter1.limit_exceeded("export").await.unwrap());

            // Give time for gossip
            tokio::time::sleep(Duration::from_millis(300)).await;

            assert!(!limiter2.limit_exceeded("export").await.unwrap());

            tokio::time::sleep(Duration::from_millis(300)).await;

            assert!(limiter1.limit_exceeded("export").await.unwrap());
            assert!(limiter2.limit_exceeded("export").await.unwrap());
        }

        Arc::try_unwrap(cluster1).unwrap().shutdown().await.unwrap();
        Arc::try_unwrap(cluster2).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_sweeper() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            store.add_one("brief_5", Duration::from_millis(20)).await.unwrap();

            let handle = store.spawn_sweeper(Duration::from_millis(30));
            tokio::time::sleep(Duration::from_millis(150)).await;
            handle.abort();
            let _ = handle.await;

            assert_eq!(store.get("brief_5").await.unwrap(), 0);
            assert_eq!(cluster.sweep_expired().await, 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
