//! Background Tasks Module
//!
//! Contains background tasks owned by a cache instance.
//!
//! # Tasks
//! - Sweep: removes expired entries, enforces capacity limits and flushes
//!   persisted changes at a fixed interval

mod cleanup;

pub use cleanup::{flush_persistent, spawn_cleanup_task};
