//! Error types for Tally.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// The store call that failed during a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Reading the current count
    Get,
    /// Recording one more use
    AddOne,
    /// Atomic increment-and-return (strict mode)
    Increment,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::Get => write!(f, "get current limit state"),
            StoreOp::AddOne => write!(f, "increase rate limit"),
            StoreOp::Increment => write!(f, "atomically increase rate limit"),
        }
    }
}

/// Main error type for Tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Invalid limiter configuration (period out of range, bad config file)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The counter store failed while checking a bucket
    #[error("failed to {op} for key {key}: {source}")]
    StoreAccess {
        key: String,
        op: StoreOp,
        #[source]
        source: StoreError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TallyError {
    pub(crate) fn store_access(key: impl Into<String>, op: StoreOp, source: StoreError) -> Self {
        TallyError::StoreAccess {
            key: key.into(),
            op,
            source,
        }
    }

    /// The bucket key involved, if this is a store access failure.
    pub fn key(&self) -> Option<&str> {
        match self {
            TallyError::StoreAccess { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;
