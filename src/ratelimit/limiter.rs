//! Core fixed window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::key::BucketKey;
use super::window::{BucketStrategy, Clock, SystemClock, MAX_PERIOD, MIN_PERIOD};
use crate::error::{Result, StoreOp, TallyError};
use crate::store::{AtomicStore, Store};

/// Snapshot of an operation's current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStatus {
    /// Store key of the current window
    pub key: BucketKey,
    /// Operations recorded so far in this window
    pub count: i64,
    /// Operations still allowed in this window
    pub remaining: i64,
    /// Time until this window ends
    pub resets_in: Duration,
}

/// Fixed window rate limiter where every attempt is counted in the bucket of
/// the window it falls into.
///
/// The limiter keeps no mutable state of its own; all counts live in the
/// store, so one instance can be shared across tasks behind an `Arc`.
pub struct FixedWindowRateLimiter<S: ?Sized> {
    /// Counter store
    store: Arc<S>,
    /// Operations permitted per window
    max_operations: i64,
    /// Window length, also used as the store time-to-live
    period: Duration,
    /// How the current time maps to a bucket
    strategy: BucketStrategy,
    /// Wall-clock source used for bucketing
    clock: Arc<dyn Clock>,
}

impl<S: ?Sized> std::fmt::Debug for FixedWindowRateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowRateLimiter")
            .field("max_operations", &self.max_operations)
            .field("period", &self.period)
            .field("strategy", &self.strategy)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<S: Store + ?Sized> FixedWindowRateLimiter<S> {
    /// Create a new limiter allowing `max_operations` per `period`.
    ///
    /// `period` must lie within 1 second and 1 hour inclusive.
    /// `max_operations` is taken as is: zero or negative limits block every
    /// operation.
    pub fn new(max_operations: i64, period: Duration, store: Arc<S>) -> Result<Self> {
        if period < MIN_PERIOD || period > MAX_PERIOD {
            return Err(TallyError::Configuration(format!(
                "period has to be between 1 second and 1 hour, got {:?}",
                period
            )));
        }

        Ok(Self {
            store,
            max_operations,
            period,
            strategy: BucketStrategy::default(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Use a different bucketing strategy.
    pub fn with_strategy(mut self, strategy: BucketStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use a different wall-clock source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Operations permitted per window.
    pub fn max_operations(&self) -> i64 {
        self.max_operations
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Bucketing strategy in use.
    pub fn strategy(&self) -> BucketStrategy {
        self.strategy
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The key a check for `operation` would use right now.
    pub fn bucket_key(&self, operation: &str) -> BucketKey {
        let bucket = self.strategy.bucket_id(self.period, self.clock.now());
        BucketKey::new(operation, bucket)
    }

    /// Check whether `operation` has used up its quota for the current window.
    ///
    /// Returns `Ok(true)` without recording anything if the limit is already
    /// reached. Otherwise records this attempt and returns `Ok(false)`.
    /// Any error means no decision could be made; the caller chooses whether
    /// to fail open or closed.
    ///
    /// Two concurrent callers may both observe a count just below the limit
    /// and both be admitted. Use [`FixedWindowRateLimiter::limit_exceeded_strict`]
    /// when the store supports it and a hard cap is required.
    pub async fn limit_exceeded(&self, operation: &str) -> Result<bool> {
        let key = self.bucket_key(operation).to_string_key();

        let count = self.store.get(&key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to read rate limit counter");
            TallyError::store_access(&key, StoreOp::Get, e)
        })?;

        trace!(
            key = %key,
            count = count,
            limit = self.max_operations,
            "Checking rate limit"
        );

        if count >= self.max_operations {
            debug!(key = %key, count = count, limit = self.max_operations, "Rate limit exceeded");
            return Ok(true);
        }

        self.store.add_one(&key, self.period).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to increment rate limit counter");
            TallyError::store_access(&key, StoreOp::AddOne, e)
        })?;

        Ok(false)
    }

    /// Report the current window for `operation` without recording anything.
    pub async fn status(&self, operation: &str) -> Result<WindowStatus> {
        let now = self.clock.now();
        let key = BucketKey::new(operation, self.strategy.bucket_id(self.period, now));
        let store_key = key.to_string_key();

        let count = self
            .store
            .get(&store_key)
            .await
            .map_err(|e| TallyError::store_access(&store_key, StoreOp::Get, e))?;

        Ok(WindowStatus {
            key,
            count,
            remaining: self.max_operations.saturating_sub(count).max(0),
            resets_in: self.strategy.resets_in(self.period, now),
        })
    }
}

impl<S: AtomicStore + ?Sized> FixedWindowRateLimiter<S> {
    /// Like [`FixedWindowRateLimiter::limit_exceeded`], but counts the attempt
    /// and reads the result in a single atomic store call.
    ///
    /// Never admits more than `max_operations` per window regardless of
    /// concurrency. Rejected attempts are still counted by the store.
    pub async fn limit_exceeded_strict(&self, operation: &str) -> Result<bool> {
        let key = self.bucket_key(operation).to_string_key();

        let count = self.store.increment(&key, self.period).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to increment rate limit counter");
            TallyError::store_access(&key, StoreOp::Increment, e)
        })?;

        trace!(key = %key, count = count, limit = self.max_operations, "Checked strict rate limit");

        let exceeded = count > self.max_operations;
        if exceeded {
            debug!(key = %key, count = count, limit = self.max_operations, "Rate limit exceeded");
        }
        Ok(exceeded)
    }
}
