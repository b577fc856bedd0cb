//! Outcome taxonomy surfaced by the resilient client.
//!
//! Raw transport errors never reach callers; every failure is one of these
//! variants so UI code can branch on a finite set of outcomes.

use serde_json::Value;

use crate::queue::QueueId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
  /// Mutation could not be delivered and was queued for replay.
  #[error("offline: request queued for later ({id})")]
  Queued { id: QueueId },

  /// Read could not be served live and nothing usable is cached.
  #[error("offline and no cached data available for {key}")]
  OfflineNoCache { key: String },

  /// Server reached, request rejected as invalid. Not retried.
  #[error("request rejected with status {status}")]
  Rejected { status: u16, body: Value },

  /// Server reached but failed; the caller may retry.
  #[error("server responded with status {status}")]
  Http { status: u16, body: Value },

  /// Request could not even be built (bad URL, unserializable body).
  #[error("invalid request: {reason}")]
  Invalid { reason: String },
}

impl FetchError {
  pub fn is_queued(&self) -> bool {
    matches!(self, FetchError::Queued { .. })
  }

  /// Whether the failure is final for this request, as opposed to deferred.
  pub fn is_permanent(&self) -> bool {
    matches!(
      self,
      FetchError::Rejected { .. } | FetchError::Invalid { .. }
    )
  }
}
