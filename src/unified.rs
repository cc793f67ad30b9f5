//! Unified Cache
//!
//! Async handle owning one cache store, its deduplicating loader and its
//! background sweeper. One instance is built per data domain at startup and
//! torn down with [`UnifiedCache::destroy`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, SetOptions, StatsSnapshot};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::loader::{run_producer, InFlightLoads, LoadFuture};
use crate::persistence::{MemoryStorage, PersistentStore, StorageBackend};
use crate::tasks::{flush_persistent, spawn_cleanup_task};

/// Bounds every cached payload type satisfies.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// == Preload Report ==
/// Per-key outcome of [`UnifiedCache::preload`].
#[derive(Debug, Default)]
pub struct PreloadReport {
    /// Keys whose value was produced (or joined) and cached
    pub loaded: Vec<String>,
    /// Keys already present, left untouched
    pub skipped: Vec<String>,
    /// Keys whose producer failed
    pub failed: Vec<(String, CacheError)>,
}

impl PreloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// == Unified Cache ==
/// Cloneable handle to one cache instance.
///
/// Clones share the same store. The sweeper stops when `destroy()` is called
/// or when the last handle is dropped.
pub struct UnifiedCache<V> {
    inner: Arc<Inner<V>>,
}

struct Inner<V> {
    config: CacheConfig,
    store: Arc<RwLock<CacheStore<V>>>,
    loads: Arc<InFlightLoads<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    destroyed: Arc<AtomicBool>,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        let slot = self.sweeper.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl<V> Clone for UnifiedCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for UnifiedCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedCache")
            .field("prefix", &self.inner.config.persistence_prefix)
            .field("destroyed", &self.inner.destroyed.load(Ordering::Acquire))
            .finish()
    }
}

impl<V: CacheValue> UnifiedCache<V> {
    // == Constructors ==
    /// Creates a cache from configuration.
    ///
    /// With persistence enabled the records go to an in-process
    /// [`MemoryStorage`]; use [`with_storage`](Self::with_storage) to supply a
    /// durable backend. Must be called inside a tokio runtime when the sweep
    /// interval is non-zero.
    pub fn new(config: CacheConfig) -> Self {
        let backend: Option<Box<dyn StorageBackend>> = if config.enable_persistence {
            Some(Box::new(MemoryStorage::new()))
        } else {
            None
        };
        Self::build(config, backend)
    }

    /// Creates a cache that persists through `backend`.
    pub fn with_storage(config: CacheConfig, backend: Box<dyn StorageBackend>) -> Self {
        Self::build(config.with_persistence(true), Some(backend))
    }

    fn build(config: CacheConfig, backend: Option<Box<dyn StorageBackend>>) -> Self {
        let mut store = CacheStore::new(&config);
        if let Some(backend) = backend {
            store = store.with_persistence(PersistentStore::new(
                backend,
                config.persistence_prefix.clone(),
                config.persistence_max_bytes,
            ));
        }
        let store = Arc::new(RwLock::new(store));

        let sweeper = (config.cleanup_interval_ms > 0).then(|| {
            spawn_cleanup_task(
                Arc::clone(&store),
                Duration::from_millis(config.cleanup_interval_ms),
            )
        });

        info!(
            prefix = %config.persistence_prefix,
            max_entries = config.max_entries,
            max_memory_mb = config.max_memory_mb,
            default_ttl_ms = config.default_ttl_ms,
            persistence = config.enable_persistence,
            "Cache created"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                loads: Arc::new(InFlightLoads::new()),
                sweeper: Mutex::new(sweeper),
                destroyed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(CacheError::Destroyed)
        } else {
            Ok(())
        }
    }

    // == Entry Operations ==
    /// Returns the live value for `key`, or `None`.
    pub async fn get(&self, key: &str) -> Option<V> {
        if self.is_destroyed() {
            return None;
        }
        self.inner.store.write().await.get(key)
    }

    /// Stores `value` under `key`. Accepts a TTL in milliseconds or [`SetOptions`].
    pub async fn set(&self, key: impl Into<String>, value: V, options: impl Into<SetOptions>) {
        let key = key.into();
        if self.is_destroyed() {
            warn!(category = "destroyed", key = %key, "Ignoring set on destroyed cache");
            return;
        }
        self.inner.store.write().await.set(key, value, options);
    }

    pub async fn delete(&self, key: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.inner.store.write().await.delete(key)
    }

    /// Checks for a live entry, in memory or persisted, without affecting
    /// statistics.
    pub async fn contains(&self, key: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.inner.store.read().await.is_cached(key)
    }

    // == Get Or Set ==
    /// Returns the cached value for `key`, computing it with `producer` on a miss.
    ///
    /// Concurrent calls for the same missing key share one producer call and
    /// all receive its result. A failed producer stores nothing, and the next
    /// call starts a fresh load.
    pub async fn get_or_set<F, Fut>(
        &self,
        key: &str,
        producer: F,
        options: impl Into<SetOptions>,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.ensure_alive()?;

        let load = {
            let mut pending = self.inner.loads.lock().await;
            if let Some(value) = self.inner.store.write().await.get(key) {
                return Ok(value);
            }
            match pending.get(key) {
                Some(load) => {
                    debug!(key = %key, "Joining in-flight load");
                    load.clone()
                }
                None => {
                    let load = self.start_load(key.to_string(), producer(), options.into());
                    pending.insert(key.to_string(), load.clone());
                    load
                }
            }
        };

        load.await
    }

    fn start_load<Fut>(&self, key: String, producer: Fut, options: SetOptions) -> LoadFuture<V>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        let loads = Arc::clone(&self.inner.loads);
        let destroyed = Arc::clone(&self.inner.destroyed);
        let timeout_ms = self.inner.config.producer_timeout_ms;

        async move {
            debug!(key = %key, "Starting load");
            let outcome = run_producer(&key, producer, timeout_ms).await;
            match &outcome {
                Ok(value) if !destroyed.load(Ordering::Acquire) => {
                    store.write().await.set(key.clone(), value.clone(), options);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(category = err.category(), key = %key, error = %err, "Load failed");
                }
            }
            loads.finish(&key).await;
            outcome
        }
        .boxed()
        .shared()
    }

    // == Preload ==
    /// Loads every key in `keys` that is not already cached, concurrently.
    ///
    /// Present keys, persisted ones included, are skipped without calling
    /// `producer`. One key failing does not stop the others from being cached.
    pub async fn preload<K, F, Fut>(
        &self,
        keys: impl IntoIterator<Item = K>,
        producer: F,
    ) -> PreloadReport
    where
        K: Into<String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let mut report = PreloadReport::default();
        let mut missing = Vec::new();
        for key in keys {
            let key = key.into();
            if self.contains(&key).await {
                report.skipped.push(key);
            } else {
                missing.push(key);
            }
        }

        let producer = &producer;
        let loads = missing.iter().map(|key| async move {
            let outcome = self
                .get_or_set(key, || producer(key.clone()), SetOptions::default())
                .await;
            (key, outcome)
        });

        for (key, outcome) in join_all(loads).await {
            match outcome {
                Ok(_) => report.loaded.push(key.clone()),
                Err(err) => report.failed.push((key.clone(), err)),
            }
        }

        info!(
            prefix = %self.inner.config.persistence_prefix,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Preload finished"
        );
        report
    }

    // == Invalidation ==
    /// Removes every entry carrying any of `tags`. Returns 0 once destroyed.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        if self.is_destroyed() {
            return 0;
        }
        self.inner.store.write().await.invalidate_by_tags(tags)
    }

    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
        self.ensure_alive()?;
        self.inner.store.write().await.invalidate_by_pattern(pattern)
    }

    // == Maintenance ==
    /// Runs the expiry sweep immediately.
    pub async fn cleanup_expired(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }
        self.inner.store.write().await.cleanup_expired()
    }

    pub async fn enforce_limits(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }
        self.inner.store.write().await.enforce_limits()
    }

    /// Removes every entry, persisted ones included, and resets statistics.
    ///
    /// Ignored once destroyed, so persisted records stay available to the
    /// next instance.
    pub async fn clear(&self) {
        if self.is_destroyed() {
            warn!(category = "destroyed", "Ignoring clear on destroyed cache");
            return;
        }
        self.inner.store.write().await.clear();
    }

    /// Writes pending persisted changes to the storage backend.
    pub async fn flush(&self) {
        flush_persistent(self.inner.store.as_ref()).await;
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.inner.store.read().await.stats()
    }

    /// Number of producer calls currently running.
    pub async fn in_flight(&self) -> usize {
        self.inner.loads.len().await
    }

    // == Destroy ==
    /// Stops the sweeper, flushes persisted changes and drops every in-memory
    /// entry.
    ///
    /// Persisted records are kept. Calling it again is a no-op.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }

        self.inner.loads.clear().await;
        self.flush().await;
        self.inner.store.write().await.clear_memory();
        info!(prefix = %self.inner.config.persistence_prefix, "Cache destroyed");
    }
}
