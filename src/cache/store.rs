//! The cache itself: an in-memory map mirrored to a [`DurableStore`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheStats};
use crate::clock::Clock;
use crate::store::{envelope, DurableStore, CACHE_KEY};

struct CacheState {
  entries: BTreeMap<String, CacheEntry>,
  /// Set after the first failed write; storage is not touched afterwards
  degraded: bool,
}

/// TTL-bounded key-value cache persisted as a single document.
pub struct DurableCache {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
  state: Mutex<CacheState>,
}

impl DurableCache {
  /// Open the cache, loading any persisted entries that have not expired.
  pub fn open(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
    let mut entries: BTreeMap<String, CacheEntry> = match store.load(CACHE_KEY) {
      Ok(Some(raw)) => envelope::decode(CACHE_KEY, &raw, |legacy| legacy).unwrap_or_default(),
      Ok(None) => BTreeMap::new(),
      Err(e) => {
        warn!(error = %e, "Failed to load persisted cache, starting empty");
        BTreeMap::new()
      }
    };

    let now = clock.now_ms();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    for (key, entry) in entries.iter_mut() {
      entry.key = key.clone();
    }
    debug!(
      loaded = entries.len(),
      dropped = before - entries.len(),
      "Cache loaded"
    );

    Self {
      store,
      clock,
      default_ttl,
      state: Mutex::new(CacheState {
        entries,
        degraded: false,
      }),
    }
  }

  /// TTL applied when a caller does not supply one.
  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Store `value` under `key` for `ttl`, replacing any existing entry.
  pub fn put(&self, key: &str, value: Value, ttl: Duration) {
    let now = self.clock.now_ms();
    // A zero TTL would violate expires_at > stored_at
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: now,
      expires_at: now.saturating_add(ttl_ms),
    };

    let mut state = self.lock();
    state.entries.insert(key.to_string(), entry);
    self.persist(&mut state);
  }

  /// Return the entry for `key` if it has not expired.
  ///
  /// An expired entry is removed as a side effect.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let now = self.clock.now_ms();
    let mut state = self.lock();

    match state.entries.get(key) {
      None => {
        debug!(key, "Cache miss");
        return None;
      }
      Some(entry) if !entry.is_expired(now) => {
        debug!(key, "Cache hit");
        return Some(entry.clone());
      }
      Some(_) => {}
    }

    debug!(key, "Cache entry expired, evicting");
    state.entries.remove(key);
    self.persist(&mut state);
    None
  }

  /// Remove every entry, or only those whose key contains `pattern`.
  ///
  /// Returns the number of entries removed.
  pub fn clear(&self, pattern: Option<&str>) -> usize {
    let mut state = self.lock();
    let before = state.entries.len();

    match pattern {
      Some(p) => state.entries.retain(|key, _| !key.contains(p)),
      None => state.entries.clear(),
    }

    let removed = before - state.entries.len();
    if removed > 0 {
      self.persist(&mut state);
    }
    removed
  }

  /// Evict every expired entry. Returns the number evicted.
  pub fn purge_expired(&self) -> usize {
    let now = self.clock.now_ms();
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|_, entry| !entry.is_expired(now));

    let removed = before - state.entries.len();
    if removed > 0 {
      self.persist(&mut state);
    }
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now_ms();
    let state = self.lock();
    CacheStats {
      entries: state.entries.len(),
      expired: state
        .entries
        .values()
        .filter(|e| e.is_expired(now))
        .count(),
      keys: state.entries.keys().cloned().collect(),
      degraded: state.degraded,
    }
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether the cache has fallen back to memory-only operation.
  pub fn is_degraded(&self) -> bool {
    self.lock().degraded
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    // State is a plain map; a panic elsewhere cannot leave it half-written
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Write the full map to storage. Called with the state lock held so
  /// concurrent writers cannot interleave.
  fn persist(&self, state: &mut CacheState) {
    if state.degraded {
      return;
    }

    let result = if state.entries.is_empty() {
      self.store.remove(CACHE_KEY)
    } else {
      envelope::encode(&state.entries).and_then(|raw| self.store.save(CACHE_KEY, &raw))
    };
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist cache, continuing in memory only");
      state.degraded = true;
    }
  }
}
