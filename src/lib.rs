//! Unified Cache - An in-process data cache
//!
//! Provides a typed key/value cache with TTL expiration, tag and pattern
//! invalidation, frequency-based eviction, optional compression, best-effort
//! persistence and deduplicated loading.

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod persistence;
pub mod tasks;
pub mod unified;

pub use cache::{CacheStore, SetOptions, StatsSnapshot};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use tasks::spawn_cleanup_task;
pub use unified::{CacheValue, PreloadReport, UnifiedCache};
