//! Core types for the response cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached payload with its validity window.
///
/// `expires_at` is always strictly greater than `stored_at`. The persisted
/// field names match the layout written by earlier clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Canonical key; stored as the map key, not inside the entry
  #[serde(skip)]
  pub key: String,
  #[serde(rename = "data")]
  pub value: Value,
  /// Epoch milliseconds
  #[serde(rename = "timestamp")]
  pub stored_at: i64,
  /// Epoch milliseconds
  #[serde(rename = "expires")]
  pub expires_at: i64,
}

impl CacheEntry {
  pub fn is_expired(&self, now_ms: i64) -> bool {
    now_ms >= self.expires_at
  }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Entries currently held, expired or not
  pub entries: usize,
  /// Entries past their expiry that have not been evicted yet
  pub expired: usize,
  pub keys: Vec<String>,
  /// True when writes no longer reach durable storage
  pub degraded: bool,
}
