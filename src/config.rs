//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;

/// Bytes in one megabyte, used for the human-scaled memory figures.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Default TTL in milliseconds for entries without explicit TTL
    pub default_ttl_ms: u64,
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// Maximum aggregate size of live entries, in megabytes
    pub max_memory_mb: f64,
    /// Compress serialized values above `compression_threshold`
    pub enable_compression: bool,
    /// Serialized size in bytes above which values are compressed
    pub compression_threshold: usize,
    /// Write entries through to the persistent store
    pub enable_persistence: bool,
    /// Background sweep interval in milliseconds, 0 disables the sweeper
    pub cleanup_interval_ms: u64,
    /// Namespace prefix for persisted keys
    pub persistence_prefix: String,
    /// Total byte budget of the persistent store
    pub persistence_max_bytes: usize,
    /// Optional upper bound on how long a producer may run
    pub producer_timeout_ms: Option<u64>,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_TTL_MS` - Default TTL in milliseconds (default: 300000)
    /// - `CACHE_MAX_ENTRIES` - Maximum cache entries (default: 1000)
    /// - `CACHE_MAX_MEMORY_MB` - Memory budget in MB (default: 50)
    /// - `CACHE_ENABLE_COMPRESSION` - Compress large values (default: true)
    /// - `CACHE_COMPRESSION_THRESHOLD` - Compression threshold in bytes (default: 1024)
    /// - `CACHE_ENABLE_PERSISTENCE` - Persist entries (default: false)
    /// - `CACHE_CLEANUP_INTERVAL_MS` - Sweep frequency in milliseconds (default: 60000)
    /// - `CACHE_PERSISTENCE_PREFIX` - Persisted key namespace (default: "cache")
    /// - `CACHE_PERSISTENCE_MAX_BYTES` - Persistent budget (default: 5 MiB)
    /// - `CACHE_PRODUCER_TIMEOUT_MS` - Producer timeout (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl_ms: parse_env("CACHE_DEFAULT_TTL_MS").unwrap_or(defaults.default_ttl_ms),
            max_entries: parse_env("CACHE_MAX_ENTRIES").unwrap_or(defaults.max_entries),
            max_memory_mb: parse_env("CACHE_MAX_MEMORY_MB").unwrap_or(defaults.max_memory_mb),
            enable_compression: parse_env("CACHE_ENABLE_COMPRESSION")
                .unwrap_or(defaults.enable_compression),
            compression_threshold: parse_env("CACHE_COMPRESSION_THRESHOLD")
                .unwrap_or(defaults.compression_threshold),
            enable_persistence: parse_env("CACHE_ENABLE_PERSISTENCE")
                .unwrap_or(defaults.enable_persistence),
            cleanup_interval_ms: parse_env("CACHE_CLEANUP_INTERVAL_MS")
                .unwrap_or(defaults.cleanup_interval_ms),
            persistence_prefix: env::var("CACHE_PERSISTENCE_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.persistence_prefix),
            persistence_max_bytes: parse_env("CACHE_PERSISTENCE_MAX_BYTES")
                .unwrap_or(defaults.persistence_max_bytes),
            producer_timeout_ms: parse_env("CACHE_PRODUCER_TIMEOUT_MS"),
        }
    }

    /// Derives a configuration for one cache domain ("services", "categories", ...).
    ///
    /// The domain name becomes the persistence prefix so that domains never
    /// share persisted keys.
    pub fn for_domain(domain: &str) -> Self {
        Self {
            persistence_prefix: domain.to_string(),
            ..Self::from_env()
        }
    }

    /// Memory budget in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb.max(0.0) * BYTES_PER_MB) as usize
    }

    pub fn with_default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_max_memory_mb(mut self, max_memory_mb: f64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    pub fn with_compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.enable_compression = enabled;
        self.compression_threshold = threshold;
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.enable_persistence = enabled;
        self
    }

    pub fn with_persistence_max_bytes(mut self, max_bytes: usize) -> Self {
        self.persistence_max_bytes = max_bytes;
        self
    }

    pub fn with_cleanup_interval_ms(mut self, interval_ms: u64) -> Self {
        self.cleanup_interval_ms = interval_ms;
        self
    }

    pub fn with_producer_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.producer_timeout_ms = timeout_ms;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5 * 60 * 1000,
            max_entries: 1000,
            max_memory_mb: 50.0,
            enable_compression: true,
            compression_threshold: 1024,
            enable_persistence: false,
            cleanup_interval_ms: 60 * 1000,
            persistence_prefix: "cache".to_string(),
            persistence_max_bytes: 5 * 1024 * 1024,
            producer_timeout_ms: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
