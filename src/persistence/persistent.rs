//! Persistent Store
//!
//! Namespaced JSON records on top of a [`StorageBackend`], with a total byte
//! budget enforced least-frequently-used first.
//!
//! Sizes, ranks and tags of every record are indexed in memory when the store
//! is opened, so budget checks and bulk removals never re-read the backend.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::entry::current_timestamp_ms;
use crate::error::{CacheError, Result};
use crate::persistence::storage::{PendingFlush, StorageBackend};

// == Persisted Record ==
/// On-disk form of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Value as JSON, or base64 deflate bytes when `compressed`
    pub data: serde_json::Value,
    /// Creation timestamp (Unix milliseconds)
    pub timestamp: u64,
    /// Lifetime in milliseconds
    pub ttl: u64,
    /// Reads served from this record
    pub hits: u64,
    pub compressed: bool,
    /// Serialized size of the value in bytes, before compression
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PersistedRecord {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }
}

/// Outcome of [`PersistentStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    Found(PersistedRecord),
    /// The record had outlived its TTL and was removed
    Expired,
    Missing,
}

impl Loaded {
    pub fn into_record(self) -> Option<PersistedRecord> {
        match self {
            Loaded::Found(record) => Some(record),
            Loaded::Expired | Loaded::Missing => None,
        }
    }
}

/// Index entry for one stored record.
#[derive(Debug, Clone)]
struct RecordMeta {
    /// Encoded JSON length
    bytes: usize,
    hits: u64,
    timestamp: u64,
    ttl: u64,
    tags: Vec<String>,
}

impl RecordMeta {
    fn new(record: &PersistedRecord, bytes: usize) -> Self {
        Self {
            bytes,
            hits: record.hits,
            timestamp: record.timestamp,
            ttl: record.ttl,
            tags: record.tags.clone(),
        }
    }

    fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }
}

// == Persistent Store ==
#[derive(Debug)]
pub struct PersistentStore {
    backend: Box<dyn StorageBackend>,
    prefix: String,
    max_bytes: usize,
    index: HashMap<String, RecordMeta>,
    /// Sum of `bytes` over the index
    total_bytes: usize,
}

impl PersistentStore {
    /// Opens the namespace `prefix` on `backend` and indexes its records.
    ///
    /// Unreadable records are dropped. A backend that cannot be listed starts
    /// with an empty index.
    pub fn new(backend: Box<dyn StorageBackend>, prefix: impl Into<String>, max_bytes: usize) -> Self {
        let mut store = Self {
            backend,
            prefix: prefix.into(),
            max_bytes,
            index: HashMap::new(),
            total_bytes: 0,
        };
        if let Err(err) = store.rebuild_index() {
            warn!(
                category = err.category(),
                prefix = %store.prefix,
                error = %err,
                "Could not index persisted records"
            );
        }
        store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn strip_namespace<'a>(&self, stored_key: &'a str) -> Option<&'a str> {
        stored_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }

    /// Bytes a record occupies in the backend, key included.
    fn stored_len(&self, key: &str, bytes: usize) -> usize {
        self.prefix.len() + 1 + key.len() + bytes
    }

    // == Index ==
    fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        self.total_bytes = 0;
        let mut corrupted = Vec::new();

        for stored_key in self.backend.keys()? {
            let Some(key) = self.strip_namespace(&stored_key).map(str::to_string) else {
                continue;
            };
            let Some(json) = self.backend.get(&stored_key)? else {
                continue;
            };
            match serde_json::from_str::<PersistedRecord>(&json) {
                Ok(record) => self.track(&key, RecordMeta::new(&record, json.len())),
                Err(_) => corrupted.push(stored_key),
            }
        }

        if !corrupted.is_empty() {
            warn!(
                category = "corruption",
                count = corrupted.len(),
                prefix = %self.prefix,
                "Dropping unreadable persisted records"
            );
            for stored_key in corrupted {
                self.backend.remove(&stored_key)?;
            }
        }
        Ok(())
    }

    fn track(&mut self, key: &str, meta: RecordMeta) {
        self.untrack(key);
        self.total_bytes += meta.bytes;
        self.index.insert(key.to_string(), meta);
    }

    fn untrack(&mut self, key: &str) -> Option<RecordMeta> {
        let meta = self.index.remove(key)?;
        self.total_bytes -= meta.bytes;
        Some(meta)
    }

    // == Put ==
    /// Writes `record` under `key`.
    ///
    /// When the backend reports a full quota, records are evicted least-hit
    /// first until the write fits. A record that cannot fit even after every
    /// other record is gone fails without evicting anything.
    pub fn put(&mut self, key: &str, record: &PersistedRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        if json.len() > self.max_bytes {
            return Err(CacheError::QuotaExceeded(format!(
                "record '{}' is {} bytes, budget is {}",
                key,
                json.len(),
                self.max_bytes
            )));
        }

        let stored_key = self.namespaced(key);
        let bytes = json.len();
        match self.backend.set(&stored_key, json.clone()) {
            Ok(()) => {}
            Err(CacheError::QuotaExceeded(reason)) => {
                self.make_room(key, &stored_key, json, reason)?;
            }
            Err(err) => return Err(err),
        }

        self.track(key, RecordMeta::new(record, bytes));
        self.enforce_budget()?;
        Ok(())
    }

    /// Evicts other records until `json` can be written under `stored_key`.
    fn make_room(&mut self, key: &str, stored_key: &str, json: String, reason: String) -> Result<()> {
        if let Some(remaining) = self.backend.remaining_bytes() {
            let needed = stored_key.len() + json.len();
            let freeable: usize = self
                .index
                .iter()
                .map(|(k, meta)| self.stored_len(k, meta.bytes))
                .sum();
            if needed > remaining + freeable {
                return Err(CacheError::QuotaExceeded(format!(
                    "record '{}' needs {} bytes, at most {} can be freed",
                    key,
                    needed,
                    remaining + freeable
                )));
            }
        }

        debug!(key = %key, reason = %reason, "Storage quota hit, evicting persisted records");
        for victim in self.ranked() {
            if victim == key {
                continue;
            }
            self.remove(&victim)?;
            match self.backend.set(stored_key, json.clone()) {
                Ok(()) => return Ok(()),
                Err(CacheError::QuotaExceeded(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CacheError::QuotaExceeded(reason))
    }

    // == Load ==
    /// Reads the record for `key`.
    ///
    /// Expired records are removed and reported as [`Loaded::Expired`].
    /// Unreadable records are removed and reported as an error.
    pub fn load(&mut self, key: &str) -> Result<Loaded> {
        let stored_key = self.namespaced(key);
        let Some(json) = self.backend.get(&stored_key)? else {
            self.untrack(key);
            return Ok(Loaded::Missing);
        };

        let record: PersistedRecord = match serde_json::from_str(&json) {
            Ok(record) => record,
            Err(err) => {
                self.remove(key)?;
                return Err(err.into());
            }
        };

        if record.is_expired_at(current_timestamp_ms()) {
            self.remove(key)?;
            return Ok(Loaded::Expired);
        }

        Ok(Loaded::Found(record))
    }

    /// Increments the hit count of a record that was just served.
    pub fn record_hit(&mut self, key: &str, record: &PersistedRecord) -> Result<()> {
        let mut updated = record.clone();
        updated.hits += 1;
        let json = serde_json::to_string(&updated)?;
        let bytes = json.len();
        let stored_key = self.namespaced(key);
        self.backend.set(&stored_key, json)?;
        self.track(key, RecordMeta::new(&updated, bytes));
        Ok(())
    }

    // == Remove ==
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let stored_key = self.namespaced(key);
        let removed = self.backend.remove(&stored_key)?;
        let tracked = self.untrack(key).is_some();
        Ok(removed || tracked)
    }

    /// Whether a live record exists for `key`.
    pub fn contains_fresh(&self, key: &str) -> bool {
        let now = current_timestamp_ms();
        self.index.get(key).is_some_and(|meta| !meta.is_expired_at(now))
    }

    /// Keys of every record in this namespace.
    pub fn keys(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    /// Encoded size of every record in this namespace.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Takes the backend write that persists recent changes.
    pub fn pending_flush(&mut self) -> Option<PendingFlush> {
        self.backend.pending_flush()
    }

    // == Budget ==
    /// Keys in eviction order: least hits first, then oldest.
    fn ranked(&self) -> Vec<String> {
        let mut ranked: Vec<(u64, u64, &String)> = self
            .index
            .iter()
            .map(|(key, meta)| (meta.hits, meta.timestamp, key))
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, _, key)| key.clone()).collect()
    }

    /// Evicts records until the namespace fits within its byte budget.
    pub fn enforce_budget(&mut self) -> Result<usize> {
        if self.total_bytes <= self.max_bytes {
            return Ok(0);
        }

        let mut evicted = 0;
        for candidate in self.ranked() {
            if self.total_bytes <= self.max_bytes {
                break;
            }
            self.remove(&candidate)?;
            evicted += 1;
        }

        debug!(prefix = %self.prefix, evicted, "Evicted persisted records over budget");
        Ok(evicted)
    }

    // == Bulk Removal ==
    /// Removes every expired record, returning their keys.
    pub fn cleanup_expired(&mut self) -> Result<Vec<String>> {
        let now = current_timestamp_ms();
        self.remove_where(|_, meta| meta.is_expired_at(now))
    }

    /// Removes every record carrying any of `tags`, returning their keys.
    pub fn invalidate_by_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<Vec<String>> {
        self.remove_where(|_, meta| {
            tags.iter()
                .any(|tag| meta.tags.iter().any(|t| t == tag.as_ref()))
        })
    }

    /// Removes every record whose key matches `pattern`, returning their keys.
    pub fn invalidate_matching(&mut self, pattern: &Regex) -> Result<Vec<String>> {
        self.remove_where(|key, _| pattern.is_match(key))
    }

    /// Removes every record in this namespace.
    pub fn clear(&mut self) -> Result<usize> {
        Ok(self.remove_where(|_, _| true)?.len())
    }

    fn remove_where<F>(&mut self, predicate: F) -> Result<Vec<String>>
    where
        F: Fn(&str, &RecordMeta) -> bool,
    {
        let doomed: Vec<String> = self
            .index
            .iter()
            .filter(|(key, meta)| predicate(key.as_str(), meta))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.remove(key)?;
        }
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::storage::MemoryStorage;
    use serde_json::json;

    fn record(hits: u64, timestamp: u64, tags: &[&str]) -> PersistedRecord {
        PersistedRecord {
            data: json!({ "id": hits, "name": "harbour tour" }),
            timestamp,
            ttl: 60_000,
            hits,
            compressed: false,
            size: 32,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn store(max_bytes: usize) -> PersistentStore {
        PersistentStore::new(Box::new(MemoryStorage::new()), "services", max_bytes)
    }

    fn sorted_keys(store: &PersistentStore) -> Vec<String> {
        let mut keys = store.keys();
        keys.sort();
        keys
    }

    #[test]
    fn test_put_and_load() {
        let mut store = store(10_000);
        let now = current_timestamp_ms();
        store.put("svc-1", &record(0, now, &[])).unwrap();

        let loaded = store.load("svc-1").unwrap().into_record().unwrap();
        assert_eq!(loaded.data["name"], "harbour tour");
        assert_eq!(store.load("missing").unwrap(), Loaded::Missing);
        assert!(store.contains_fresh("svc-1"));
    }

    #[test]
    fn test_record_format_field_names() {
        let json = serde_json::to_value(record(2, 10, &[])).unwrap();
        for field in ["data", "timestamp", "ttl", "hits", "compressed", "size"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert!(json.get("tags").is_none());
    }

    #[test]
    fn test_keys_are_namespaced() {
        let mut backend = MemoryStorage::new();
        backend.set("other:svc-1", "{}".to_string()).unwrap();

        let mut store = PersistentStore::new(Box::new(backend), "services", 10_000);
        store
            .put("svc-1", &record(0, current_timestamp_ms(), &[]))
            .unwrap();

        assert_eq!(store.keys(), vec!["svc-1".to_string()]);
        assert_eq!(store.clear().unwrap(), 1);
    }

    #[test]
    fn test_existing_records_are_indexed_on_open() {
        let now = current_timestamp_ms();
        let json = serde_json::to_string(&record(3, now, &["X"])).unwrap();
        let mut backend = MemoryStorage::new();
        backend.set("services:svc-1", json.clone()).unwrap();
        backend.set("services:bad", "{oops".to_string()).unwrap();

        let mut store = PersistentStore::new(Box::new(backend), "services", 10_000);

        assert_eq!(store.keys(), vec!["svc-1".to_string()]);
        assert_eq!(store.total_bytes(), json.len());
        assert_eq!(store.invalidate_by_tags(&["X"]).unwrap(), vec!["svc-1".to_string()]);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_expired_records_are_dropped_on_load() {
        let mut store = store(10_000);
        store.put("old", &record(0, 1, &[])).unwrap();
        assert!(!store.contains_fresh("old"));

        assert_eq!(store.load("old").unwrap(), Loaded::Expired);
        assert!(store.keys().is_empty());
        assert_eq!(store.load("old").unwrap(), Loaded::Missing);
    }

    #[test]
    fn test_corrupt_record_is_removed() {
        let mut backend = MemoryStorage::new();
        backend.set("services:bad", "{oops".to_string()).unwrap();
        let mut store = PersistentStore::new(Box::new(backend), "services", 10_000);

        // Dropped while indexing, so a later write is the only way back in.
        assert_eq!(store.load("bad").unwrap(), Loaded::Missing);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_total_bytes_tracks_overwrites_and_removals() {
        let now = current_timestamp_ms();
        let mut store = store(100_000);
        let one = serde_json::to_string(&record(0, now, &[])).unwrap().len();

        store.put("a", &record(0, now, &[])).unwrap();
        store.put("a", &record(0, now, &[])).unwrap();
        store.put("b", &record(0, now, &[])).unwrap();
        assert_eq!(store.total_bytes(), one * 2);

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.total_bytes(), one);
    }

    #[test]
    fn test_budget_evicts_least_hit_then_oldest() {
        let now = current_timestamp_ms();
        let one = serde_json::to_string(&record(0, now, &[])).unwrap().len();
        let mut store = store(one * 2 + one / 2);

        store.put("popular", &record(5, now - 30, &[])).unwrap();
        store.put("oldest", &record(0, now - 20, &[])).unwrap();
        store.put("newest", &record(0, now - 10, &[])).unwrap();

        assert_eq!(
            sorted_keys(&store),
            vec!["newest".to_string(), "popular".to_string()]
        );
    }

    #[test]
    fn test_quota_error_evicts_and_retries() {
        let now = current_timestamp_ms();
        let one = serde_json::to_string(&record(0, now, &[])).unwrap().len();
        let quota = ("services:a".len() + one) * 2 + 4;
        let mut store = PersistentStore::new(
            Box::new(MemoryStorage::with_quota(quota)),
            "services",
            1_000_000,
        );

        store.put("a", &record(0, now - 20, &[])).unwrap();
        store.put("b", &record(0, now - 10, &[])).unwrap();
        store.put("c", &record(0, now, &[])).unwrap();

        assert_eq!(sorted_keys(&store), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_record_too_large_for_quota_keeps_other_records() {
        let now = current_timestamp_ms();
        let mut store = PersistentStore::new(
            Box::new(MemoryStorage::with_quota(400)),
            "services",
            1_000_000,
        );
        store.put("a", &record(0, now - 10, &[])).unwrap();
        store.put("b", &record(0, now, &[])).unwrap();

        let mut big = record(0, now, &[]);
        big.data = json!("x".repeat(2000));
        let result = store.put("big", &big);

        assert!(matches!(result, Err(CacheError::QuotaExceeded(_))));
        assert_eq!(sorted_keys(&store), vec!["a".to_string(), "b".to_string()]);
        assert!(store.load("a").unwrap().into_record().is_some());
        assert!(store.load("b").unwrap().into_record().is_some());
    }

    #[test]
    fn test_invalidate_by_tags_and_pattern() {
        let now = current_timestamp_ms();
        let mut store = store(100_000);
        store.put("tour:1", &record(0, now, &["X"])).unwrap();
        store.put("tour:2", &record(0, now, &["Y"])).unwrap();
        store.put("hotel:1", &record(0, now, &["X"])).unwrap();

        let mut removed = store.invalidate_by_tags(&["X"]).unwrap();
        removed.sort();
        assert_eq!(removed, vec!["hotel:1".to_string(), "tour:1".to_string()]);

        let pattern = Regex::new("^tour:").unwrap();
        assert_eq!(
            store.invalidate_matching(&pattern).unwrap(),
            vec!["tour:2".to_string()]
        );
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_cleanup_expired_returns_keys() {
        let now = current_timestamp_ms();
        let mut store = store(100_000);
        store.put("stale", &record(0, 1, &[])).unwrap();
        store.put("fresh", &record(0, now, &[])).unwrap();

        assert_eq!(store.cleanup_expired().unwrap(), vec!["stale".to_string()]);
        assert_eq!(store.keys(), vec!["fresh".to_string()]);
    }
}
