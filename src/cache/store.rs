//! Cache Store Module
//!
//! Main cache engine combining HashMap storage with a tag index, TTL expiration,
//! frequency-based eviction, optional compression and write-through persistence.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::codec::{self, Codec};
use crate::cache::entry::{current_timestamp_ms, CacheEntry, Payload, SetOptions};
use crate::cache::stats::{CacheStats, LiveTotals, StatsSnapshot};
use crate::cache::tags::TagIndex;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::persistence::{Loaded, PendingFlush, PersistedRecord, PersistentStore};

/// Outcome of one background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

// == Cache Store ==
/// Main cache storage with TTL expiry, tag invalidation and capacity eviction.
///
/// All operations are synchronous; the async handle in [`crate::UnifiedCache`]
/// serializes access to one store.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// Key-value storage
    entries: HashMap<String, CacheEntry<V>>,
    /// Tag to keys index
    tags: TagIndex,
    /// Cumulative counters
    stats: CacheStats,
    /// Size accounting and compression
    codec: Codec,
    /// Default TTL in milliseconds for entries without explicit TTL
    default_ttl_ms: u64,
    /// Maximum number of entries allowed
    max_entries: usize,
    /// Maximum sum of entry sizes allowed
    max_memory_bytes: usize,
    /// Sum of `size_bytes` over every stored entry
    memory_usage: usize,
    /// Optional write-through persistent layer
    persistent: Option<PersistentStore>,
}

impl<V> CacheStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    // == Constructor ==
    /// Creates a new in-memory CacheStore from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            tags: TagIndex::new(),
            stats: CacheStats::new(),
            codec: Codec::new(config.enable_compression, config.compression_threshold),
            default_ttl_ms: config.default_ttl_ms,
            max_entries: config.max_entries,
            max_memory_bytes: config.max_memory_bytes(),
            memory_usage: 0,
            persistent: None,
        }
    }

    /// Attaches a persistent layer that every write goes through to.
    pub fn with_persistence(mut self, persistent: PersistentStore) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn has_persistence(&self) -> bool {
        self.persistent.is_some()
    }

    // == Get ==
    /// Retrieves a value by key.
    ///
    /// Returns `None` for missing, expired and undecodable entries; the last
    /// two are removed. A memory miss falls back to the persistent layer.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let started = Instant::now();
        let value = self.lookup(key);
        self.stats.record_lookup_time(started.elapsed());
        value
    }

    fn lookup(&mut self, key: &str) -> Option<V> {
        let now = current_timestamp_ms();
        let Some(entry) = self.entries.get_mut(key) else {
            let value = self.load_persisted(key);
            if value.is_none() {
                debug!(key = %key, "Cache miss");
                self.stats.record_miss();
            }
            return value;
        };

        if entry.is_expired_at(now) {
            self.remove_entry(key);
            self.forget_persisted(key);
            self.stats.record_expirations(1);
            self.stats.record_miss();
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        match self.codec.decode(&entry.payload) {
            Ok(value) => {
                entry.hit_count += 1;
                self.stats.record_hit();
                Some(value)
            }
            Err(err) => {
                self.remove_entry(key);
                self.forget_persisted(key);
                self.stats.record_corruption();
                self.stats.record_miss();
                warn!(
                    category = "corruption",
                    key = %key,
                    error = %err,
                    "Dropping undecodable cache entry"
                );
                None
            }
        }
    }

    /// Rehydrates `key` from the persistent layer, counting a hit on success.
    fn load_persisted(&mut self, key: &str) -> Option<V> {
        let loaded = self.persistent.as_mut()?.load(key);
        let record = match loaded {
            Ok(Loaded::Found(record)) => record,
            Ok(Loaded::Missing) => return None,
            Ok(Loaded::Expired) => {
                debug!(key = %key, "Persisted record expired");
                self.stats.record_expirations(1);
                return None;
            }
            Err(err) => {
                self.record_failure(key, &err);
                return None;
            }
        };

        let (payload, value) =
            match codec::from_persisted_data::<V>(record.data.clone(), record.compressed) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.forget_persisted(key);
                    self.stats.record_corruption();
                    warn!(
                        category = "corruption",
                        key = %key,
                        error = %err,
                        "Dropping undecodable persisted record"
                    );
                    return None;
                }
            };

        if let Some(persistent) = self.persistent.as_mut() {
            if let Err(err) = persistent.record_hit(key, &record) {
                self.record_failure(key, &err);
            }
        }

        let size_bytes = match &payload {
            Payload::Compressed(bytes) => bytes.len(),
            Payload::Plain(_) => record.size,
        };
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            stored_at: record.timestamp,
            ttl_ms: record.ttl,
            tags: record.tags.into_iter().collect(),
            hit_count: record.hits + 1,
            size_bytes,
            original_size: record.size,
        };

        debug!(key = %key, "Cache hit from persistent store");
        self.insert_entry(entry);
        self.stats.record_persistent_hit();
        self.enforce_limits();
        Some(value)
    }

    // == Set ==
    /// Stores a value, fully replacing any previous entry under `key`.
    ///
    /// Never fails. Serialization and compression problems fall back to storing
    /// the plain value; persistence problems fall back to memory-only.
    pub fn set(&mut self, key: impl Into<String>, value: V, options: impl Into<SetOptions>) {
        let key = key.into();
        let options = options.into();
        let ttl_ms = options.ttl_ms.unwrap_or(self.default_ttl_ms);

        let encoded = self.codec.encode(value);
        let serializable = !matches!(encoded.failure, Some(CacheError::Serialization(_)));
        if let Some(err) = &encoded.failure {
            self.record_failure(&key, err);
        }

        let tags: HashSet<String> = options.tags.into_iter().collect();
        let entry = CacheEntry::new(
            key.clone(),
            encoded.payload,
            ttl_ms,
            tags,
            encoded.size_bytes,
            encoded.original_size,
        );

        self.remove_entry(&key);
        if serializable {
            self.persist(&entry);
        } else {
            self.forget_persisted(&key);
        }
        self.insert_entry(entry);
        self.enforce_limits();
    }

    fn persist(&mut self, entry: &CacheEntry<V>) {
        let Some(persistent) = self.persistent.as_mut() else {
            return;
        };

        let result = codec::to_persisted_data(&entry.payload).and_then(|data| {
            let record = PersistedRecord {
                data,
                timestamp: entry.stored_at,
                ttl: entry.ttl_ms,
                hits: entry.hit_count,
                compressed: entry.is_compressed(),
                size: entry.original_size,
                tags: entry.tags.iter().cloned().collect(),
            };
            persistent.put(&entry.key, &record)
        });

        if let Err(err) = result {
            // The previous record must not outlive the entry it described.
            self.forget_persisted(&entry.key);
            self.record_failure(&entry.key, &err);
        }
    }

    // == Delete ==
    /// Removes an entry by key from memory and the persistent layer.
    ///
    /// Returns whether anything was removed.
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.remove_entry(key).is_some();
        let persisted = match self.persistent.as_mut().map(|p| p.remove(key)) {
            Some(Ok(found)) => found,
            Some(Err(err)) => {
                self.record_failure(key, &err);
                false
            }
            None => false,
        };
        removed || persisted
    }

    // == Clear ==
    /// Removes every entry, in memory and persisted, and resets all counters.
    pub fn clear(&mut self) {
        self.clear_memory();

        let cleared = self.persistent.as_mut().map(|p| p.clear());
        if let Some(Err(err)) = cleared {
            self.record_failure("*", &err);
        }
    }

    /// Removes every in-memory entry and resets all counters, keeping
    /// persisted records for a later instance to rehydrate.
    pub fn clear_memory(&mut self) {
        self.entries.clear();
        self.tags.clear();
        self.memory_usage = 0;
        self.stats.reset();
    }

    // == Cleanup Expired ==
    /// Removes all expired entries from the cache, persisted ones included.
    ///
    /// Returns the number of distinct keys removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = current_timestamp_ms();
        let mut expired: HashSet<String> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired {
            self.remove_entry(key);
        }

        let swept = self.persistent.as_mut().map(|p| p.cleanup_expired());
        match swept {
            Some(Ok(keys)) => {
                if !keys.is_empty() {
                    debug!(count = keys.len(), "Removed expired persisted records");
                }
                expired.extend(keys);
            }
            Some(Err(err)) => self.record_failure("*", &err),
            None => {}
        }

        self.stats.record_expirations(expired.len());
        expired.len()
    }

    // == Enforce Limits ==
    /// Evicts entries until both the entry count and memory budget hold.
    ///
    /// Candidates are taken least hits first, then oldest. Returns the number
    /// of entries evicted.
    pub fn enforce_limits(&mut self) -> usize {
        if self.within_limits() {
            return 0;
        }

        let mut candidates: Vec<(u64, u64, String)> = self
            .entries
            .values()
            .map(|entry| {
                let (hits, stored_at) = entry.eviction_rank();
                (hits, stored_at, entry.key.clone())
            })
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, _, key) in candidates {
            if self.within_limits() {
                break;
            }
            if self.remove_entry(&key).is_some() {
                self.stats.record_eviction();
                evicted += 1;
            }
        }

        debug!(
            evicted,
            entries = self.entries.len(),
            memory_bytes = self.memory_usage,
            "Enforced cache limits"
        );
        evicted
    }

    fn within_limits(&self) -> bool {
        self.entries.len() <= self.max_entries && self.memory_usage <= self.max_memory_bytes
    }

    /// Expires stale entries, then enforces capacity limits.
    pub fn sweep(&mut self) -> SweepReport {
        SweepReport {
            expired: self.cleanup_expired(),
            evicted: self.enforce_limits(),
        }
    }

    // == Invalidation ==
    /// Removes every entry carrying any of `tags`, in memory and persisted.
    ///
    /// Returns the number of distinct keys removed.
    pub fn invalidate_by_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> usize {
        let mut removed: HashSet<String> = self
            .tags
            .keys_for_any(tags)
            .into_iter()
            .filter(|key| self.remove_entry(key).is_some())
            .collect();

        let persisted = self.persistent.as_mut().map(|p| p.invalidate_by_tags(tags));
        self.merge_persisted_removals(&mut removed, persisted);

        let names: Vec<&str> = tags.iter().map(AsRef::as_ref).collect();
        info!(tags = ?names, removed = removed.len(), "Invalidated cache entries by tag");
        removed.len()
    }

    /// Removes every entry whose key matches the regular expression `pattern`.
    pub fn invalidate_by_pattern(&mut self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)?;
        Ok(self.invalidate_matching(&regex))
    }

    /// Removes every entry whose key matches `regex`, in memory and persisted.
    pub fn invalidate_matching(&mut self, regex: &Regex) -> usize {
        let mut removed: HashSet<String> = self
            .entries
            .keys()
            .filter(|key| regex.is_match(key))
            .cloned()
            .collect();
        for key in &removed {
            self.remove_entry(key);
        }

        let persisted = self.persistent.as_mut().map(|p| p.invalidate_matching(regex));
        self.merge_persisted_removals(&mut removed, persisted);

        info!(pattern = %regex, removed = removed.len(), "Invalidated cache entries by pattern");
        removed.len()
    }

    fn merge_persisted_removals(
        &mut self,
        removed: &mut HashSet<String>,
        persisted: Option<Result<Vec<String>>>,
    ) {
        match persisted {
            Some(Ok(keys)) => removed.extend(keys),
            Some(Err(err)) => self.record_failure("*", &err),
            None => {}
        }
    }

    // == Stats ==
    /// Returns a snapshot of counters and live-entry totals.
    pub fn stats(&self) -> StatsSnapshot {
        let now = current_timestamp_ms();
        let mut live = LiveTotals::default();
        for entry in self.entries.values().filter(|e| !e.is_expired_at(now)) {
            live.entries += 1;
            live.memory_bytes += entry.size_bytes;
            if entry.is_compressed() {
                live.compressed_entries += 1;
                live.compressed_bytes += entry.size_bytes;
                live.compressed_original_bytes += entry.original_size;
            }
        }
        StatsSnapshot::new(&self.stats, live)
    }

    // == Inspection ==
    /// Checks for a live entry without touching hit counts or statistics.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Checks for a live entry in memory or in the persistent layer, without
    /// touching statistics.
    pub fn is_cached(&self, key: &str) -> bool {
        self.contains_key(key)
            || self
                .persistent
                .as_ref()
                .is_some_and(|p| p.contains_fresh(key))
    }

    /// Returns the stored entry, expired or not, without side effects.
    pub fn peek_entry(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Keys of every live entry.
    pub fn keys(&self) -> Vec<String> {
        let now = current_timestamp_ms();
        self.entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// Sum of entry sizes currently held, including not-yet-swept expired entries.
    pub fn memory_usage_bytes(&self) -> usize {
        self.memory_usage
    }

    // == Length ==
    /// Returns the number of stored entries, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // == Internals ==
    fn insert_entry(&mut self, entry: CacheEntry<V>) {
        self.remove_entry(&entry.key);
        self.tags.add(&entry.key, &entry.tags);
        self.memory_usage += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.tags.remove(key, &entry.tags);
        self.memory_usage -= entry.size_bytes;
        Some(entry)
    }

    fn forget_persisted(&mut self, key: &str) {
        let removed = self.persistent.as_mut().map(|p| p.remove(key));
        if let Some(Err(err)) = removed {
            self.record_failure(key, &err);
        }
    }

    // == Flush ==
    /// Takes the persistent layer's pending backend write, if any.
    pub fn take_pending_flush(&mut self) -> Option<PendingFlush> {
        self.persistent.as_mut()?.pending_flush()
    }

    /// Counts a backend write that failed after it left the store.
    pub fn record_flush_failure(&mut self, err: &CacheError) {
        self.record_failure("*", err);
    }

    fn record_failure(&mut self, key: &str, err: &CacheError) {
        self.stats.record_failure(err);
        warn!(
            category = err.category(),
            key = %key,
            error = %err,
            "Recovered cache failure"
        );
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStorage;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::thread::sleep;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Itinerary {
        id: u64,
        stops: Vec<String>,
    }

    fn config() -> CacheConfig {
        CacheConfig::default().with_persistence(false)
    }

    fn store() -> CacheStore<Value> {
        CacheStore::new(&config())
    }

    fn persistent_store(cfg: &CacheConfig) -> CacheStore<Value> {
        let persistent = PersistentStore::new(
            Box::new(MemoryStorage::new()),
            cfg.persistence_prefix.clone(),
            cfg.persistence_max_bytes,
        );
        CacheStore::new(cfg).with_persistence(persistent)
    }

    fn long_itinerary() -> Itinerary {
        Itinerary {
            id: 9,
            stops: (0..200).map(|i| format!("lighthouse viewpoint {}", i)).collect(),
        }
    }

    #[test]
    fn test_store_new() {
        let store = store();
        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert!(!store.has_persistence());
    }

    #[test]
    fn test_store_set_and_get() {
        let mut store = store();

        store.set("svc-1", json!({"id": 1}), SetOptions::default());
        let value = store.get("svc-1").unwrap();

        assert_eq!(value, json!({"id": 1}));
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek_entry("svc-1").unwrap().hit_count, 1);
    }

    #[test]
    fn test_store_get_nonexistent() {
        let mut store = store();

        assert!(store.get("nonexistent").is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_store_delete() {
        let mut store = store();

        store.set("key1", json!("value1"), SetOptions::new().tags(["X"]));
        assert!(store.delete("key1"));

        assert!(store.is_empty());
        assert!(store.tag_index().is_empty());
        assert!(!store.delete("key1"));
    }

    #[test]
    fn test_store_overwrite_replaces_tags_and_size() {
        let mut store = store();

        store.set("key1", json!("v"), SetOptions::new().tags(["old"]));
        store.set("key1", json!("a much longer value"), SetOptions::new().tags(["new"]));

        assert_eq!(store.get("key1").unwrap(), json!("a much longer value"));
        assert_eq!(store.len(), 1);
        assert!(!store.tag_index().has_tag("old"));
        assert!(store.tag_index().contains("new", "key1"));
        assert_eq!(store.memory_usage_bytes(), "\"a much longer value\"".len());
    }

    #[test]
    fn test_store_ttl_expiration() {
        let mut store = store();

        store.set("svc-1", json!({"id": 1}), 50u64);
        assert!(store.get("svc-1").is_some());

        sleep(Duration::from_millis(120));

        assert!(store.get("svc-1").is_none());
        let stats = store.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_store_cleanup_expired() {
        let mut store = store();

        store.set("key1", json!(1), 50u64);
        store.set("key2", json!(2), 60_000u64);

        sleep(Duration::from_millis(120));

        assert_eq!(store.stats().total_entries, 1);
        let removed = store.cleanup_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().expirations, 1);
        assert!(store.get("key2").is_some());
    }

    #[test]
    fn test_store_evicts_least_frequently_used() {
        let mut store = CacheStore::new(&config().with_max_entries(3));

        store.set("a", json!(1), SetOptions::default());
        store.set("b", json!(2), SetOptions::default());
        store.set("c", json!(3), SetOptions::default());

        store.get("a");
        store.get("a");
        store.get("c");

        store.set("d", json!(4), SetOptions::default());

        assert_eq!(store.len(), 3);
        assert!(store.peek_entry("b").is_none());
        assert!(store.contains_key("a"));
        assert!(store.contains_key("c"));
        assert!(store.contains_key("d"));

        let stats = store.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.expirations, 0);
    }

    #[test]
    fn test_store_evicts_oldest_among_equal_hits() {
        let mut store = CacheStore::new(&config().with_max_entries(2));

        store.set("first", json!(1), SetOptions::default());
        sleep(Duration::from_millis(5));
        store.set("second", json!(2), SetOptions::default());
        sleep(Duration::from_millis(5));
        store.set("third", json!(3), SetOptions::default());

        assert!(store.peek_entry("first").is_none());
        assert!(store.contains_key("second"));
        assert!(store.contains_key("third"));
    }

    #[test]
    fn test_store_enforces_memory_budget() {
        let cfg = config()
            .with_compression(false, 0)
            .with_max_memory_mb(100.0 / crate::config::BYTES_PER_MB);
        let budget = cfg.max_memory_bytes();
        let mut store = CacheStore::new(&cfg);

        for i in 0..5 {
            store.set(format!("key{}", i), json!("x".repeat(30)), SetOptions::default());
            assert!(store.memory_usage_bytes() <= budget);
        }

        assert!(store.stats().evictions >= 2);
        assert!(store.contains_key("key4"));
    }

    #[test]
    fn test_compression_is_transparent() {
        let cfg = config().with_compression(true, 128);
        let mut store: CacheStore<Itinerary> = CacheStore::new(&cfg);
        let itinerary = long_itinerary();

        store.set("trip", itinerary.clone(), SetOptions::default());

        let entry = store.peek_entry("trip").unwrap();
        assert!(entry.is_compressed());
        assert!(entry.size_bytes < entry.original_size);
        assert_eq!(store.get("trip").unwrap(), itinerary);

        let stats = store.stats();
        assert_eq!(stats.compressed_entries, 1);
        assert!(stats.compression_ratio.unwrap() < 1.0);
    }

    #[test]
    fn test_corrupted_entry_reads_as_miss() {
        let cfg = config().with_compression(true, 128);
        let mut store: CacheStore<Itinerary> = CacheStore::new(&cfg);
        store.set("trip", long_itinerary(), SetOptions::default());

        store.entries.get_mut("trip").unwrap().payload = Payload::Compressed(vec![1, 2, 3]);

        assert!(store.get("trip").is_none());
        assert!(store.is_empty());
        assert_eq!(store.memory_usage_bytes(), 0);
        let stats = store.stats();
        assert_eq!(stats.corruption_failures, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_unserializable_value_is_kept_in_memory() {
        let mut store: CacheStore<HashMap<(u8, u8), u8>> = CacheStore::new(&config());
        let mut value = HashMap::new();
        value.insert((1, 2), 3);

        store.set("pairs", value.clone(), SetOptions::default());

        assert_eq!(store.get("pairs").unwrap(), value);
        assert_eq!(store.stats().serialization_failures, 1);
    }

    #[test]
    fn test_invalidate_by_tags() {
        let mut store = store();
        let v = json!({"id": 1});

        store.set("a", v.clone(), SetOptions::new().tags(["X"]));
        store.set("b", v.clone(), SetOptions::new().tags(["X"]));
        store.set("c", v.clone(), SetOptions::new().tags(["Y"]));

        assert_eq!(store.invalidate_by_tags(&["X"]), 2);
        assert_eq!(store.get("c").unwrap(), v);
        assert!(store.get("a").is_none());
        assert!(!store.tag_index().has_tag("X"));
        assert_eq!(store.stats().total_entries, 1);
    }

    #[test]
    fn test_invalidate_by_tags_is_logical_or() {
        let mut store = store();
        store.set("a", json!(1), SetOptions::new().tags(["X", "Z"]));
        store.set("b", json!(2), SetOptions::new().tags(["Y"]));
        store.set("c", json!(3), SetOptions::default());

        assert_eq!(store.invalidate_by_tags(&["X", "Y"]), 2);
        assert_eq!(store.keys(), vec!["c".to_string()]);
        assert!(store.tag_index().is_empty());
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let mut store = store();
        store.set("services:1", json!(1), SetOptions::new().tags(["S"]));
        store.set("services:2", json!(2), SetOptions::default());
        store.set("categories:1", json!(3), SetOptions::default());

        assert_eq!(store.invalidate_by_pattern("^services:").unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(!store.tag_index().has_tag("S"));
    }

    #[test]
    fn test_invalidate_by_invalid_pattern() {
        let mut store = store();
        store.set("a", json!(1), SetOptions::default());

        let result = store.invalidate_by_pattern("(unclosed");
        assert!(matches!(result, Err(CacheError::InvalidPattern(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_stats() {
        let mut store = store();

        store.set("key1", json!("value1"), SetOptions::default());
        store.get("key1");
        store.get("nonexistent");

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.memory_usage_bytes, "\"value1\"".len());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut store = store();
        store.set("a", json!(1), SetOptions::new().tags(["X"]));
        store.get("a");
        store.get("missing");

        store.clear();

        let stats = store.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.memory_usage_bytes, 0);
        assert!(store.tag_index().is_empty());
    }

    #[test]
    fn test_sweep_reports_both_causes() {
        let mut store = CacheStore::new(&config().with_max_entries(10));
        store.set("short", json!(1), 20u64);
        store.set("long", json!(2), 60_000u64);

        sleep(Duration::from_millis(60));

        let report = store.sweep();
        assert_eq!(report, SweepReport { expired: 1, evicted: 0 });
    }

    #[test]
    fn test_persistent_fallback_rehydrates_memory() {
        let cfg = config().with_persistence(true).with_max_entries(1);
        let mut store = persistent_store(&cfg);

        store.set("a", json!({"id": 1}), SetOptions::new().tags(["X"]));
        store.set("b", json!({"id": 2}), SetOptions::default());
        assert!(store.peek_entry("a").is_none());

        assert_eq!(store.get("a").unwrap(), json!({"id": 1}));
        assert!(store.tag_index().contains("X", "a"));

        let stats = store.stats();
        assert_eq!(stats.persistent_hits, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_persistent_records_follow_invalidation() {
        let cfg = config().with_persistence(true).with_max_entries(1);
        let mut store = persistent_store(&cfg);

        store.set("a", json!(1), SetOptions::new().tags(["X"]));
        store.set("b", json!(2), SetOptions::default());

        // "a" now only lives in the persistent layer.
        assert!(store.is_cached("a"));
        assert!(!store.contains_key("a"));
        assert_eq!(store.invalidate_by_tags(&["X"]), 1);
        assert!(!store.is_cached("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_pattern_invalidation_counts_persisted_only_keys() {
        let cfg = config().with_persistence(true).with_max_entries(1);
        let mut store = persistent_store(&cfg);

        store.set("tour:1", json!(1), SetOptions::default());
        store.set("tour:2", json!(2), SetOptions::default());

        // tour:1 was evicted from memory, tour:2 lives in both layers.
        assert_eq!(store.invalidate_by_pattern("^tour:").unwrap(), 2);
        assert!(store.get("tour:1").is_none());
        assert!(store.get("tour:2").is_none());
    }

    #[test]
    fn test_expired_persisted_record_counts_as_expiration() {
        let cfg = config().with_persistence(true).with_max_entries(1);
        let mut store = persistent_store(&cfg);

        store.set("short", json!(1), 20u64);
        sleep(Duration::from_millis(5));
        store.set("other", json!(2), SetOptions::default());
        assert!(store.peek_entry("short").is_none());

        sleep(Duration::from_millis(60));

        assert!(store.get("short").is_none());
        let stats = store.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.persistent_hits, 0);
    }

    #[test]
    fn test_cleanup_counts_persisted_only_expirations_once() {
        let cfg = config().with_persistence(true).with_max_entries(1);
        let mut store = persistent_store(&cfg);

        store.set("a", json!(1), 20u64);
        store.set("b", json!(2), 20u64);

        sleep(Duration::from_millis(60));

        // "a" is persisted only, "b" lives in both layers.
        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.stats().expirations, 2);
    }

    #[test]
    fn test_quota_failure_degrades_to_memory_only() {
        let cfg = config().with_persistence(true);
        let persistent = PersistentStore::new(
            Box::new(MemoryStorage::with_quota(8)),
            "tours",
            cfg.persistence_max_bytes,
        );
        let mut store: CacheStore<Value> = CacheStore::new(&cfg).with_persistence(persistent);

        store.set("a", json!({"id": 1}), SetOptions::default());

        assert_eq!(store.get("a").unwrap(), json!({"id": 1}));
        assert_eq!(store.stats().persistence_failures, 1);
    }

    #[test]
    fn test_compressed_entry_round_trips_through_persistence() {
        let cfg = config()
            .with_persistence(true)
            .with_compression(true, 128)
            .with_max_entries(1);
        let persistent = PersistentStore::new(
            Box::new(MemoryStorage::new()),
            "trips",
            cfg.persistence_max_bytes,
        );
        let mut store: CacheStore<Itinerary> = CacheStore::new(&cfg).with_persistence(persistent);
        let itinerary = long_itinerary();

        store.set("trip", itinerary.clone(), SetOptions::default());
        sleep(Duration::from_millis(5));
        store.set(
            "other",
            Itinerary {
                id: 1,
                stops: vec![],
            },
            SetOptions::default(),
        );

        assert_eq!(store.get("trip").unwrap(), itinerary);
        assert!(store.peek_entry("trip").unwrap().is_compressed());
    }
}
