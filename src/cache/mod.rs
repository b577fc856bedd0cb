//! Durable response cache with TTL-bounded entries.
//!
//! This module provides the key-value cache behind the resilient client:
//! - Entries are timestamped and expire after a per-entry TTL
//! - Expired entries read as absent and are evicted lazily
//! - The whole map is persisted after each mutation so it survives restarts
//! - Storage write failures degrade the cache to memory-only operation

mod entry;
mod store;

pub use entry::{CacheEntry, CacheStats};
pub use store::DurableCache;
