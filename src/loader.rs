//! Deduplicating Loader
//!
//! Tracks in-flight producer calls so that concurrent misses on one key share
//! a single computation.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{CacheError, Result};

/// A producer call that any number of waiters can await.
pub type LoadFuture<V> = Shared<BoxFuture<'static, Result<V>>>;

// == In-Flight Loads ==
/// Table of pending loads keyed by cache key.
///
/// A slot exists from the moment a producer is started until its result has
/// been stored, so a finished load is always visible either here or in the
/// store.
pub struct InFlightLoads<V> {
    pending: Mutex<HashMap<String, LoadFuture<V>>>,
}

impl<V> InFlightLoads<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the table. Callers check the store while holding this guard.
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<String, LoadFuture<V>>> {
        self.pending.lock().await
    }

    /// Drops the slot for `key` once its load has settled.
    pub async fn finish(&self, key: &str) -> bool {
        self.pending.lock().await.remove(key).is_some()
    }

    /// Number of loads currently running.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forgets every pending load. Waiters already holding a load still get its result.
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }
}

impl<V> Default for InFlightLoads<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// == Run Producer ==
/// Awaits a caller-supplied producer, applying the optional timeout.
pub async fn run_producer<V, Fut>(key: &str, producer: Fut, timeout_ms: Option<u64>) -> Result<V>
where
    Fut: Future<Output = anyhow::Result<V>>,
{
    match timeout_ms {
        None => producer.await.map_err(CacheError::producer),
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), producer).await {
            Ok(outcome) => outcome.map_err(CacheError::producer),
            Err(_) => Err(CacheError::ProducerTimeout {
                key: key.to_string(),
                timeout_ms: ms,
            }),
        },
    }
}
