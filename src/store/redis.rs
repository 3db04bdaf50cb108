//! Counter store backed by Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::info;

use super::{AtomicStore, Store, StoreError};

/// INCR and PEXPIRE in one server-side step.
const INCREMENT_SCRIPT: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
    return count
"#;

/// Store keeping one Redis string counter per bucket key.
///
/// Keys are written as `{prefix}:{bucket_key}`.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    prefix: String,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "Connected to Redis counter store");
        Ok(Self::from_connection_manager(connection_manager, prefix))
    }

    /// Build a store from an existing connection manager.
    pub fn from_connection_manager(
        connection_manager: ConnectionManager,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            connection_manager,
            prefix: prefix.into(),
            script: Script::new(INCREMENT_SCRIPT),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection_manager = self.connection_manager.clone();
        let count: Option<i64> = connection_manager.get(self.redis_key(key)).await?;
        Ok(count.unwrap_or(0).max(0))
    }

    async fn add_one(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.increment(key, ttl).await.map(|_| ())
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut connection_manager = self.connection_manager.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let count: i64 = self
            .script
            .key(self.redis_key(key))
            .arg(ttl_ms)
            .invoke_async(&mut connection_manager)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn redis_url() -> Option<String> {
        env::var("REDIS_URL").ok()
    }

    fn unique_prefix() -> String {
        let n: u64 = rand::random();
        format!("tally_test_{n}")
    }

    #[tokio::test]
    async fn test_redis_store_counts_and_expires() {
        let Some(url) = redis_url() else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };
        let store = RedisStore::connect(&url, unique_prefix()).await.unwrap();

        assert_eq!(store.get("login_1").await.unwrap(), 0);
        store.add_one("login_1", Duration::from_millis(200)).await.unwrap();
        assert_eq!(store.increment("login_1", Duration::from_millis(200)).await.unwrap(), 2);
        assert_eq!(store.get("login_1").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get("login_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redis_store_prefixes_keys() {
        let Some(url) = redis_url() else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };
        let prefix = unique_prefix();
        let store = RedisStore::connect(&url, prefix.clone()).await.unwrap();
        store.add_one("search_9", Duration::from_secs(5)).await.unwrap();

        let client = Client::open(url).unwrap();
        let mut conn = client.get_connection_manager().await.unwrap();
        let raw: i64 = conn.get(format!("{prefix}:search_9")).await.unwrap();
        assert_eq!(raw, 1);
    }
}
