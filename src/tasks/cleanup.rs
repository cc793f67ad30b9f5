//! Background Sweeper
//!
//! Background task that periodically removes expired cache entries,
//! re-checks capacity limits and flushes persisted changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::CacheError;
use crate::persistence::PendingFlush;
use crate::CacheValue;

/// Spawns a background task that periodically sweeps a cache store.
///
/// The task runs in an infinite loop, sleeping for `interval` between runs.
/// Each run takes the write lock once to expire stale entries, enforce the
/// capacity limits and collect pending persistence writes. The writes run on
/// the blocking pool after the lock is released.
///
/// # Returns
/// A JoinHandle for the spawned task. The owning cache aborts it on
/// `destroy()`.
///
/// # Example
/// ```ignore
/// let store = Arc::new(RwLock::new(CacheStore::<Value>::new(&config)));
/// let sweeper = spawn_cleanup_task(store.clone(), Duration::from_secs(60));
/// // Later, during teardown:
/// sweeper.abort();
/// ```
pub fn spawn_cleanup_task<V>(cache: Arc<RwLock<CacheStore<V>>>, interval: Duration) -> JoinHandle<()>
where
    V: CacheValue,
{
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting cache sweep task"
        );

        loop {
            tokio::time::sleep(interval).await;

            let (report, pending) = {
                let mut cache_guard = cache.write().await;
                (cache_guard.sweep(), cache_guard.take_pending_flush())
            };

            if report.expired > 0 || report.evicted > 0 {
                info!(
                    expired = report.expired,
                    evicted = report.evicted,
                    "Cache sweep removed entries"
                );
            } else {
                debug!("Cache sweep: nothing to remove");
            }

            if let Some(pending) = pending {
                run_flush(cache.as_ref(), pending).await;
            }
        }
    })
}

/// Writes pending persisted changes of `cache` without holding its lock
/// during the I/O.
pub async fn flush_persistent<V>(cache: &RwLock<CacheStore<V>>)
where
    V: CacheValue,
{
    let pending = cache.write().await.take_pending_flush();
    if let Some(pending) = pending {
        run_flush(cache, pending).await;
    }
}

async fn run_flush<V>(cache: &RwLock<CacheStore<V>>, pending: PendingFlush)
where
    V: CacheValue,
{
    let err = match tokio::task::spawn_blocking(move || pending.run()).await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(join_err) => CacheError::Storage(join_err.to_string()),
    };
    warn!(category = err.category(), error = %err, "Failed to flush persisted cache records");
    cache.write().await.record_flush_failure(&err);
}
