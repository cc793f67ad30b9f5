//! Persistence Module
//!
//! Best-effort local persistence for cache entries.

mod persistent;
mod storage;

pub use persistent::{Loaded, PersistedRecord, PersistentStore};
pub use storage::{FileStorage, MemoryStorage, PendingFlush, StorageBackend};
