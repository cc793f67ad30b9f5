//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::collections::HashSet;

// == Payload ==
/// Stored representation of a cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<V> {
    /// The value as handed to `set`
    Plain(V),
    /// Deflate-compressed JSON encoding of the value
    Compressed(Vec<u8>),
}

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Key the entry is stored under
    pub key: String,
    /// The stored value, possibly compressed
    pub payload: Payload<V>,
    /// Creation/last-write timestamp (Unix milliseconds)
    pub stored_at: u64,
    /// Lifetime in milliseconds, measured from `stored_at`
    pub ttl_ms: u64,
    /// Labels used for bulk invalidation
    pub tags: HashSet<String>,
    /// Successful reads since creation
    pub hit_count: u64,
    /// Bytes the payload occupies (compressed size when compressed)
    pub size_bytes: usize,
    /// Serialized size before compression
    pub original_size: usize,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry stamped with the current time.
    pub fn new(
        key: String,
        payload: Payload<V>,
        ttl_ms: u64,
        tags: HashSet<String>,
        size_bytes: usize,
        original_size: usize,
    ) -> Self {
        Self {
            key,
            payload,
            stored_at: current_timestamp_ms(),
            ttl_ms,
            tags,
            hit_count: 0,
            size_bytes,
            original_size,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry stays valid while `now - stored_at <= ttl_ms` and is expired
    /// strictly after that.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Same as [`is_expired`](Self::is_expired) against a caller-supplied clock.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at) > self.ttl_ms
    }

    /// Whether the payload must be decompressed before it is returned.
    pub fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Compressed(_))
    }

    /// Eviction ordering key: least hits first, then oldest.
    pub fn eviction_rank(&self) -> (u64, u64) {
        (self.hit_count, self.stored_at)
    }
}

// == Set Options ==
/// Per-call options for `set`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// TTL override in milliseconds, store default when `None`
    pub ttl_ms: Option<u64>,
    /// Tags attached to the entry
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A bare number is read as a TTL in milliseconds.
impl From<u64> for SetOptions {
    fn from(ttl_ms: u64) -> Self {
        Self::new().ttl_ms(ttl_ms)
    }
}

impl From<Option<u64>> for SetOptions {
    fn from(ttl_ms: Option<u64>) -> Self {
        Self {
            ttl_ms,
            tags: Vec::new(),
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
