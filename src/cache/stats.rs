//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, evictions and expirations.

use std::time::Duration;

use serde::Serialize;

use crate::config::BYTES_PER_MB;
use crate::error::CacheError;

// == Cache Stats ==
/// Cumulative counters owned by the store.
///
/// Entry counts and memory figures are not kept here; they are read from the
/// live entries whenever a snapshot is taken.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found, expired or corrupted)
    pub misses: u64,
    /// Number of entries removed to satisfy capacity limits
    pub evictions: u64,
    /// Number of entries removed because their TTL elapsed
    pub expirations: u64,
    /// Hits served from the persistent store after a memory miss
    pub persistent_hits: u64,
    /// Values that could not be serialized
    pub serialization_failures: u64,
    /// Values that could not be compressed
    pub compression_failures: u64,
    /// Entries dropped because they could not be decoded
    pub corruption_failures: u64,
    /// Persistent writes or reads that failed
    pub persistence_failures: u64,
    /// Number of timed lookups
    lookups: u64,
    /// Total time spent in timed lookups
    lookup_time: Duration,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Mean lookup latency in milliseconds.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.lookup_time.as_secs_f64() * 1000.0 / self.lookups as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_persistent_hit(&mut self) {
        self.hits += 1;
        self.persistent_hits += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub fn record_lookup_time(&mut self, elapsed: Duration) {
        self.lookups += 1;
        self.lookup_time += elapsed;
    }

    // == Record Failure ==
    /// Bumps the diagnostic counter matching the error category.
    pub fn record_failure(&mut self, err: &CacheError) {
        match err {
            CacheError::Serialization(_) => self.serialization_failures += 1,
            CacheError::Compression(_) => self.compression_failures += 1,
            CacheError::Storage(_) | CacheError::QuotaExceeded(_) => {
                self.persistence_failures += 1
            }
            _ => {}
        }
    }

    pub fn record_corruption(&mut self) {
        self.corruption_failures += 1;
    }

    // == Reset ==
    /// Zeroes every cumulative counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// == Stats Snapshot ==
/// Point-in-time view of cache health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_entries: usize,
    pub memory_usage_bytes: usize,
    pub memory_usage_mb: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_response_time_ms: f64,
    pub compressed_entries: usize,
    /// Compressed size over original size across compressed entries
    pub compression_ratio: Option<f64>,
    pub evictions: u64,
    pub expirations: u64,
    pub persistent_hits: u64,
    pub serialization_failures: u64,
    pub compression_failures: u64,
    pub corruption_failures: u64,
    pub persistence_failures: u64,
}

/// Live-entry figures gathered by the store for a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveTotals {
    pub entries: usize,
    pub memory_bytes: usize,
    pub compressed_entries: usize,
    pub compressed_bytes: usize,
    pub compressed_original_bytes: usize,
}

impl StatsSnapshot {
    /// Combines cumulative counters with live totals.
    pub fn new(stats: &CacheStats, live: LiveTotals) -> Self {
        let compression_ratio = if live.compressed_original_bytes == 0 {
            None
        } else {
            Some(live.compressed_bytes as f64 / live.compressed_original_bytes as f64)
        };

        Self {
            total_entries: live.entries,
            memory_usage_bytes: live.memory_bytes,
            memory_usage_mb: live.memory_bytes as f64 / BYTES_PER_MB,
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            avg_response_time_ms: stats.avg_response_time_ms(),
            compressed_entries: live.compressed_entries,
            compression_ratio,
            evictions: stats.evictions,
            expirations: stats.expirations,
            persistent_hits: stats.persistent_hits,
            serialization_failures: stats.serialization_failures,
            compression_failures: stats.compression_failures,
            corruption_failures: stats.corruption_failures,
            persistence_failures: stats.persistence_failures,
        }
    }
}
