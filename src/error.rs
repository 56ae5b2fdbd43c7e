//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::sync::Arc;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The entry is stale and another caller (computing or reading) holds its lock. Retryable.
    #[error("entry is locked by another caller while stale")]
    ConcurrentComputeConflict,

    /// The value producer failed. The same cause is handed to every caller
    /// that observed this computation.
    #[error("value producer failed: {0:#}")]
    ProducerFailed(Arc<anyhow::Error>),

    /// The entry is marked valid but its producer panicked before storing anything
    #[error("computation was abandoned before producing a value")]
    ComputationAbandoned,

    /// Rejected construction parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    // == Retryable ==
    /// Returns true for errors a caller may clear by retrying right away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::ConcurrentComputeConflict)
    }

    /// Returns the producer's error, if this is a producer failure.
    pub fn producer_cause(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::ProducerFailed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
