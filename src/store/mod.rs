//! Counter stores consulted by the rate limiter.
//!
//! A store holds one integer counter per bucket key, each with its own
//! expiry. The limiter only ever reads and increments; reclaiming old
//! buckets is the store's job, driven by the time-to-live handed to it on
//! every increment.

mod memory;
mod mesh;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::mesh::ClusterError;

pub use memory::MemoryStore;
pub use mesh::MeshStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors raised by counter store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Generic backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Gossip cluster failure
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Redis failure
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Keyed counter with per-key expiry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Current count for `key`, or zero if it was never set or has expired.
    ///
    /// Never negative.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically add one to `key`, creating it at 1 if absent, and reset its
    /// expiry to `ttl` from now.
    async fn add_one(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

/// A store that can increment and report the new value in one atomic step.
#[async_trait]
pub trait AtomicStore: Store {
    /// Same semantics as [`Store::add_one`], returning the count after the
    /// increment.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;
}

