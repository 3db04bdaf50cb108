//! In-process counter store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{AtomicStore, Store, StoreError};

/// Increments between two opportunistic sweeps, unless configured otherwise.
const DEFAULT_SWEEP_EVERY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: i64,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counter store backed by a concurrent hash map.
///
/// Increments go through the map's entry API, which holds the shard lock for
/// the key, so concurrent `add_one` calls on one key are never lost.
/// Expired entries read as zero. A read that finds an expired entry removes
/// it, and every `sweep_every` increments the whole map is swept, so old
/// buckets are reclaimed without a background task. The sweeper spawned by
/// [`MemoryStore::spawn_sweeper`] additionally bounds how long they linger.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    /// Increments since the store was created
    increments: AtomicUsize,
    sweep_every: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            increments: AtomicUsize::new(0),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired entries once every `increments` increments (at least 1).
    pub fn with_sweep_every(mut self, increments: usize) -> Self {
        self.sweep_every = increments.max(1);
        self
    }

    /// Number of entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawn a task that sweeps expired entries every `interval`.
    ///
    /// The task runs until aborted or until the runtime shuts down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!(removed = removed, remaining = store.len(), "Swept expired counters");
                }
            }
        })
    }

    fn bump(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Backend(format!("time-to-live {:?} is out of range", ttl)))?;

        let count = self.increment_entry(key, now, expires_at);

        let increments = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if increments % self.sweep_every == 0 {
            let removed = self.sweep_expired();
            if removed > 0 {
                debug!(removed = removed, remaining = self.len(), "Swept expired counters");
            }
        }

        Ok(count)
    }

    /// Must not be called while holding another reference into the map.
    fn increment_entry(&self, key: &str, now: Instant, expires_at: Instant) -> i64 {
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at,
        });
        if entry.is_expired(now) {
            entry.count = 0;
        }
        entry.count += 1;
        entry.expires_at = expires_at;

        trace!(key = %key, count = entry.count, "Incremented in-memory counter");
        entry.count
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(entry.count.max(0)),
            Some(_) => {}
            None => return Ok(0),
        }

        // The read guard is released above; drop the stale bucket unless an
        // increment revived it in the meantime.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(0)
    }

    async fn add_one(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bump(key, ttl).map(|_| ())
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.bump(key, ttl)
    }
}
