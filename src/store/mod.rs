//! Durable key-value storage for persisted cache and queue state.
//!
//! Each persisted structure is stored as one JSON document under a fixed,
//! namespaced key, wrapped in a versioned envelope (see [`envelope`]).

pub mod envelope;
mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key under which the response cache is persisted.
pub const CACHE_KEY: &str = "offsync.cache";
/// Key under which the pending-request queue is persisted.
pub const QUEUE_KEY: &str = "offsync.queue";

/// Trait for durable storage backends.
pub trait DurableStore: Send + Sync {
  /// Read the document stored under `key`.
  fn load(&self, key: &str) -> Result<Option<String>>;

  /// Write `value` under `key`, replacing any previous document.
  fn save(&self, key: &str, value: &str) -> Result<()>;

  /// Remove the document stored under `key`.
  fn remove(&self, key: &str) -> Result<()>;
}
