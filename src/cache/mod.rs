//! Cache Module
//!
//! Provides the synchronous cache engine: TTL expiration, tag and pattern
//! invalidation, frequency-based eviction, compression and statistics.

pub mod codec;
pub mod entry;
mod stats;
mod store;
mod tags;


// Re-export public types
pub use codec::Codec;
pub use entry::{CacheEntry, Payload, SetOptions};
pub use stats::{CacheStats, LiveTotals, StatsSnapshot};
pub use store::{CacheStore, SweepReport};
pub use tags::TagIndex;
