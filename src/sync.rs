//! Replays queued mutations once connectivity returns.
//!
//! A drain cycle snapshots the queue and attempts every entry once, in
//! enqueue order:
//! 1. 2xx: the entry is dequeued and counted as synced
//! 2. Definitive client error: dequeued and reported as failed, no retry
//! 3. Anything else: its retry count is bumped; at the ceiling it is evicted
//!    and reported as failed, otherwise it waits for the next cycle
//!
//! Ordering is best-effort: live requests issued while a drain runs may
//! interleave with replayed ones.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::http::{HttpTransport, ResponseClass, TransportError};
use crate::notify::{Notification, NotificationSink};
use crate::queue::{PendingQueue, QueueId, QueuedRequest, RetryOutcome};

/// Why a queued request was abandoned.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
  /// Server rejected the request as invalid
  Rejected { status: u16 },
  /// Request could not be built
  Invalid { reason: String },
  /// Retry ceiling reached; carries the last error seen
  RetriesExhausted { last_error: String },
}

/// A queued request that will never be replayed again.
#[derive(Debug, Clone, PartialEq)]
pub struct PermanentFailure {
  pub request: QueuedRequest,
  pub reason: FailureReason,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainSummary {
  pub succeeded: Vec<QueueId>,
  pub failed: Vec<PermanentFailure>,
  /// Entries left in the queue for a later cycle
  pub retained: usize,
  /// True when the cycle did not run (offline, or another drain in progress)
  pub skipped: bool,
}

impl DrainSummary {
  fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }

  pub fn succeeded_count(&self) -> usize {
    self.succeeded.len()
  }

  pub fn failed_count(&self) -> usize {
    self.failed.len()
  }
}

/// Resets the in-progress flag when a drain finishes, however it finishes.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Drains the pending queue through the live transport.
pub struct SyncEngine {
  queue: Arc<PendingQueue>,
  http: Arc<dyn HttpTransport>,
  monitor: Arc<ConnectivityMonitor>,
  sink: Arc<dyn NotificationSink>,
  clock: Arc<dyn Clock>,
  draining: AtomicBool,
  /// Epoch milliseconds of the last completed cycle, 0 if none
  last_sync: AtomicI64,
}

impl SyncEngine {
  pub fn new(
    queue: Arc<PendingQueue>,
    http: Arc<dyn HttpTransport>,
    monitor: Arc<ConnectivityMonitor>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      queue,
      http,
      monitor,
      sink,
      clock,
      draining: AtomicBool::new(false),
      last_sync: AtomicI64::new(0),
    }
  }

  /// Whether a drain cycle is currently running.
  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// When the last drain cycle completed.
  pub fn last_sync(&self) -> Option<i64> {
    match self.last_sync.load(Ordering::Acquire) {
      0 => None,
      ts => Some(ts),
    }
  }

  /// Start a drain in the background without waiting for it.
  pub fn trigger(self: &Arc<Self>) -> JoinHandle<DrainSummary> {
    self.trigger_after(Duration::ZERO)
  }

  /// Start a background drain once `delay` has passed. Connectivity is
  /// checked when the drain starts, not when it is scheduled.
  pub fn trigger_after(self: &Arc<Self>, delay: Duration) -> JoinHandle<DrainSummary> {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      if !delay.is_zero() {
        debug!(delay_ms = delay.as_millis() as u64, "Drain scheduled");
        tokio::time::sleep(delay).await;
      }
      engine.drain().await
    })
  }

  /// Run one drain cycle.
  ///
  /// A call made while another cycle is running returns immediately with a
  /// skipped summary; triggers coalesce rather than queue up.
  pub async fn drain(&self) -> DrainSummary {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("Drain already in progress, ignoring trigger");
      return DrainSummary::skipped();
    }
    let _guard = DrainGuard(&self.draining);

    if !self.monitor.is_online() {
      debug!("Offline, skipping drain");
      return DrainSummary::skipped();
    }

    let snapshot = self.queue.list();
    let mut summary = DrainSummary::default();

    if !snapshot.is_empty() {
      info!(pending = snapshot.len(), "Draining pending requests");
    }

    for item in snapshot {
      self.replay(item, &mut summary).await;
    }

    self
      .last_sync
      .store(self.clock.now_ms(), Ordering::Release);
    self.report(&summary);
    summary
  }

  async fn replay(&self, item: QueuedRequest, summary: &mut DrainSummary) {
    let descriptor = item.to_descriptor();

    let last_error = match self.http.send(&descriptor).await {
      Ok(response) => match response.class() {
        ResponseClass::Success => {
          debug!(id = %item.id, status = response.status, "Replayed request");
          self.queue.dequeue(&item.id);
          summary.succeeded.push(item.id);
          return;
        }
        ResponseClass::ClientError => {
          self.queue.dequeue(&item.id);
          self.fail(
            item,
            FailureReason::Rejected {
              status: response.status,
            },
            summary,
          );
          return;
        }
        ResponseClass::TransientError => format!("HTTP {}", response.status),
      },
      Err(TransportError::InvalidRequest(reason)) => {
        self.queue.dequeue(&item.id);
        self.fail(item, FailureReason::Invalid { reason }, summary);
        return;
      }
      Err(e) => e.to_string(),
    };

    match self.queue.increment_retry(&item.id) {
      RetryOutcome::Retry(updated) => {
        warn!(
          id = %updated.id,
          retries = updated.retry_count,
          max_retries = updated.max_retries,
          error = %last_error,
          "Replay failed, will retry"
        );
        summary.retained += 1;
      }
      RetryOutcome::Evicted(evicted) => {
        self.fail(evicted, FailureReason::RetriesExhausted { last_error }, summary);
      }
      // Removed while we were replaying it, e.g. the queue was cleared
      RetryOutcome::Missing => {}
    }
  }

  fn fail(&self, request: QueuedRequest, reason: FailureReason, summary: &mut DrainSummary) {
    error!(
      id = %request.id,
      method = %request.method,
      url = %request.url,
      reason = ?reason,
      "Request permanently failed"
    );
    summary.failed.push(PermanentFailure { request, reason });
  }

  fn report(&self, summary: &DrainSummary) {
    if summary.succeeded.is_empty() && summary.failed.is_empty() && summary.retained == 0 {
      return;
    }

    info!(
      succeeded = summary.succeeded_count(),
      failed = summary.failed_count(),
      retained = summary.retained,
      "Drain cycle finished"
    );

    if !summary.succeeded.is_empty() {
      self.sink.notify(Notification::success(
        "Data Synced",
        format!(
          "{} requests synced successfully.",
          summary.succeeded_count()
        ),
      ));
    }

    if !summary.failed.is_empty() {
      self.sink.notify(Notification::error(
        "Sync Failed",
        format!("{} requests failed to sync.", summary.failed_count()),
      ));
    }
  }
}
