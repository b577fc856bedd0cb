//! Durable queue of mutations that could not be delivered.
//!
//! Entries are replayed in enqueue order by the sync engine. Each entry
//! carries its own retry ceiling; an entry whose retry count reaches the
//! ceiling is evicted and reported, never silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::request::{CachePolicy, Method, RequestDescriptor};
use crate::store::{envelope, DurableStore, QUEUE_KEY};

/// Unique identifier of a queued request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
  pub fn generate() -> Self {
    Self(Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for QueueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for QueueId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
  pub id: QueueId,
  pub url: String,
  pub method: Method,
  #[serde(rename = "data", default)]
  pub body: Option<Value>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Epoch milliseconds
  #[serde(rename = "timestamp")]
  pub enqueued_at: i64,
  #[serde(rename = "retries")]
  pub retry_count: u32,
  pub max_retries: u32,
}

impl QueuedRequest {
  /// Descriptor used to replay this request.
  pub fn to_descriptor(&self) -> RequestDescriptor {
    RequestDescriptor {
      method: self.method,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      policy: CachePolicy::Mutation,
      ttl_ms: None,
    }
  }
}

/// Result of recording a failed replay.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
  /// Still queued; will be attempted again next drain
  Retry(QueuedRequest),
  /// Retry ceiling reached; the entry has been removed
  Evicted(QueuedRequest),
  /// No entry with that id
  Missing,
}

struct QueueState {
  items: Vec<QueuedRequest>,
  degraded: bool,
}

/// FIFO queue of pending mutations, persisted after every change.
pub struct PendingQueue {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  max_retries: u32,
  state: Mutex<QueueState>,
}

impl PendingQueue {
  /// Open the queue, restoring any persisted entries.
  pub fn open(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
    let items: Vec<QueuedRequest> = match store.load(QUEUE_KEY) {
      Ok(Some(raw)) => envelope::decode(QUEUE_KEY, &raw, migrate_legacy).unwrap_or_default(),
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "Failed to load persisted queue, starting empty");
        Vec::new()
      }
    };

    if !items.is_empty() {
      info!(pending = items.len(), "Restored pending requests");
    }

    Self {
      store,
      clock,
      max_retries: max_retries.max(1),
      state: Mutex::new(QueueState {
        items,
        degraded: false,
      }),
    }
  }

  /// Retry ceiling given to newly queued requests.
  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Append a request with a fresh retry count.
  pub fn enqueue(&self, request: &RequestDescriptor) -> QueueId {
    let item = QueuedRequest {
      id: QueueId::generate(),
      url: request.url.clone(),
      method: request.method,
      body: request.body.clone(),
      headers: request.headers.clone(),
      enqueued_at: self.clock.now_ms(),
      retry_count: 0,
      max_retries: self.max_retries,
    };
    let id = item.id.clone();
    debug!(%id, method = %item.method, url = %item.url, "Queued request");

    let mut state = self.lock();
    state.items.push(item);
    self.persist(&mut state);
    id
  }

  /// Remove the entry with `id`.
  pub fn dequeue(&self, id: &QueueId) -> Option<QueuedRequest> {
    let mut state = self.lock();
    let pos = state.items.iter().position(|item| &item.id == id)?;
    let item = state.items.remove(pos);
    self.persist(&mut state);
    Some(item)
  }

  /// Snapshot of all entries in enqueue order.
  pub fn list(&self) -> Vec<QueuedRequest> {
    self.lock().items.clone()
  }

  /// Record a failed replay of `id`.
  ///
  /// The entry is evicted once its retry count reaches its ceiling, so it is
  /// attempted at most `max_retries` times in total.
  pub fn increment_retry(&self, id: &QueueId) -> RetryOutcome {
    let mut state = self.lock();
    let Some(pos) = state.items.iter().position(|item| &item.id == id) else {
      return RetryOutcome::Missing;
    };

    let item = &mut state.items[pos];
    item.retry_count += 1;

    let outcome = if item.retry_count >= item.max_retries {
      let evicted = state.items.remove(pos);
      warn!(
        id = %evicted.id,
        retries = evicted.retry_count,
        "Request exceeded retry ceiling, evicting"
      );
      RetryOutcome::Evicted(evicted)
    } else {
      RetryOutcome::Retry(item.clone())
    };

    self.persist(&mut state);
    outcome
  }

  /// Remove every entry. Returns the number removed.
  pub fn clear(&self) -> usize {
    let mut state = self.lock();
    let removed = state.items.len();
    state.items.clear();
    self.persist(&mut state);
    removed
  }

  pub fn len(&self) -> usize {
    self.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_degraded(&self) -> bool {
    self.lock().degraded
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist(&self, state: &mut QueueState) {
    if state.degraded {
      return;
    }

    // An empty queue leaves no document behind
    let result = if state.items.is_empty() {
      self.store.remove(QUEUE_KEY)
    } else {
      envelope::encode(&state.items).and_then(|raw| self.store.save(QUEUE_KEY, &raw))
    };
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist queue, continuing in memory only");
      state.degraded = true;
    }
  }
}

/// Bring a queue written by the browser client into the current shape.
///
/// Those ids were floating point numbers, headers could be null, and the
/// method could be missing or lowercase.
fn migrate_legacy(value: Value) -> Value {
  let Value::Array(items) = value else {
    return value;
  };

  let items = items
    .into_iter()
    .map(|mut item| {
      if let Value::Object(map) = &mut item {
        if let Some(id) = map.get("id").filter(|id| !id.is_string()).cloned() {
          map.insert("id".into(), Value::String(id.to_string()));
        }
        if map.get("headers").map_or(true, Value::is_null) {
          map.insert("headers".into(), Value::Object(Default::default()));
        }
        let method = map
          .get("method")
          .and_then(Value::as_str)
          .unwrap_or("GET")
          .to_ascii_uppercase();
        map.insert("method".into(), Value::String(method));
      }
      item
    })
    .collect();

  Value::Array(items)
}
