//! Tally - Fixed Time Window Rate Limiting
//!
//! This crate answers one question before a rate-limited action runs: has
//! this operation already used up its quota for the current time window?
//! Counts live in a pluggable store, which may be process-local, shared
//! through a gossip mesh of peer nodes, or kept in Redis.

pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;

pub use error::{Result, StoreOp, TallyError};
pub use ratelimit::{BucketStrategy, FixedWindowRateLimiter, WindowStatus};
pub use store::{AtomicStore, MemoryStore, Store, StoreError};
