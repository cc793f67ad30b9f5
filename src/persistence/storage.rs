//! Storage Backends
//!
//! Pluggable string key/value stores behind the persistent cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{CacheError, Result};

// == Pending Flush ==
/// Deferred write that makes a backend's recent changes durable.
///
/// Produced while the cache is locked and run afterwards, typically on the
/// blocking thread pool.
pub struct PendingFlush(Box<dyn FnOnce() -> Result<()> + Send>);

impl PendingFlush {
    pub fn new<F>(write: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self(Box::new(write))
    }

    pub fn run(self) -> Result<()> {
        (self.0)()
    }
}

impl fmt::Debug for PendingFlush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingFlush")
    }
}

// == Storage Backend ==
/// Minimal key/value contract the persistent store is written against.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Returns `CacheError::QuotaExceeded` when the backend is full.
    fn set(&mut self, key: &str, value: String) -> Result<()>;

    /// Removes `key`, returning whether it was present.
    fn remove(&mut self, key: &str) -> Result<bool>;

    /// Lists every stored key.
    fn keys(&self) -> Result<Vec<String>>;

    /// Free space left under the backend's quota, counted as key plus value
    /// bytes. `None` when the backend has no known limit.
    fn remaining_bytes(&self) -> Option<usize> {
        None
    }

    /// Takes the write that persists changes made since the last flush.
    fn pending_flush(&mut self) -> Option<PendingFlush> {
        None
    }
}

// == Memory Storage ==
/// In-memory backend with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: HashMap<String, String>,
    used_bytes: usize,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that rejects writes once keys plus values exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Bytes used by keys and values.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        let replaced = self.items.get(key).map_or(0, |v| key.len() + v.len());
        let needed = self.used_bytes - replaced + key.len() + value.len();
        if let Some(quota) = self.quota_bytes {
            if needed > quota {
                return Err(CacheError::QuotaExceeded(format!(
                    "writing '{}' needs {} bytes, quota is {}",
                    key, needed, quota
                )));
            }
        }
        self.items.insert(key.to_string(), value);
        self.used_bytes = needed;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        match self.items.remove(key) {
            Some(value) => {
                self.used_bytes -= key.len() + value.len();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.keys().cloned().collect())
    }

    fn remaining_bytes(&self) -> Option<usize> {
        self.quota_bytes
            .map(|quota| quota.saturating_sub(self.used_bytes))
    }
}

// == File Storage ==
/// Backend that mirrors its map into a single JSON file.
///
/// Changes stay in memory until a flush. [`pending_flush`](StorageBackend::pending_flush)
/// snapshots the map and hands back the file write so it can run off the
/// cache lock; dropping the storage flushes synchronously. A missing or
/// unreadable file starts an empty store.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: BTreeMap<String, String>,
    dirty: bool,
    /// Snapshot number handed to the latest pending flush
    generation: u64,
    /// Snapshot number last written to disk
    written: Arc<Mutex<u64>>,
}

impl FileStorage {
    /// Opens (or prepares to create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CacheError::Storage(e.to_string()))?;
        }

        let items = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    category = "storage",
                    path = %path.display(),
                    error = %err,
                    "Discarding unreadable storage file"
                );
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(CacheError::Storage(err.to_string())),
        };

        Ok(Self {
            path,
            items,
            dirty: false,
            generation: 0,
            written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether changes are waiting for a flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes pending changes on the current thread.
    pub fn flush(&mut self) -> Result<()> {
        match self.pending_flush() {
            Some(pending) => pending.run(),
            None => Ok(()),
        }
    }
}

/// Writes one snapshot unless a newer one already reached the disk.
fn write_snapshot(path: &Path, contents: &str, generation: u64, written: &Mutex<u64>) -> Result<()> {
    let mut last = written.lock().unwrap_or_else(|e| e.into_inner());
    if *last >= generation {
        return Ok(());
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|e| CacheError::Storage(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| CacheError::Storage(e.to_string()))?;
    *last = generation;
    Ok(())
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.items.insert(key.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        if self.items.remove(key).is_none() {
            return Ok(false);
        }
        self.dirty = true;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.keys().cloned().collect())
    }

    fn pending_flush(&mut self) -> Option<PendingFlush> {
        if !self.dirty {
            return None;
        }

        let contents = match serde_json::to_string(&self.items) {
            Ok(contents) => contents,
            Err(err) => return Some(PendingFlush::new(move || Err(err.into()))),
        };
        self.dirty = false;
        self.generation += 1;

        let generation = self.generation;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        Some(PendingFlush::new(move || {
            write_snapshot(&path, &contents, generation, &written)
        }))
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(
                category = err.category(),
                path = %self.path.display(),
                error = %err,
                "Failed to flush storage file"
            );
        }
    }
}
