//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use std::sync::Arc;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
///
/// Only `InvalidPattern`, `Producer`, `ProducerTimeout` and `Destroyed` ever
/// reach a caller. The remaining variants are recovered inside the cache and
/// surface as log events and diagnostic counters.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Invalidation pattern could not be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Caller-supplied producer failed
    #[error("Producer failed: {0}")]
    Producer(Arc<anyhow::Error>),

    /// Caller-supplied producer did not resolve in time
    #[error("Producer for key '{key}' timed out after {timeout_ms}ms")]
    ProducerTimeout { key: String, timeout_ms: u64 },

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Value could not be compressed or decompressed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage backend rejected a write because its quota is exhausted
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Cache was used after `destroy()`
    #[error("Cache has been destroyed")]
    Destroyed,
}

impl CacheError {
    /// Wraps a producer failure so it can be shared between waiters.
    pub fn producer(err: anyhow::Error) -> Self {
        CacheError::Producer(Arc::new(err))
    }

    /// Short label used as the `category` field of diagnostic events.
    pub fn category(&self) -> &'static str {
        match self {
            CacheError::InvalidPattern(_) => "pattern",
            CacheError::Producer(_) => "producer",
            CacheError::ProducerTimeout { .. } => "producer_timeout",
            CacheError::Serialization(_) => "serialization",
            CacheError::Compression(_) => "compression",
            CacheError::Storage(_) => "storage",
            CacheError::QuotaExceeded(_) => "quota",
            CacheError::Destroyed => "destroyed",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for CacheError {
    fn from(err: regex::Error) -> Self {
        CacheError::InvalidPattern(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
