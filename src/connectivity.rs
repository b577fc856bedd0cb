//! Connectivity tracking.
//!
//! [`ConnectivityMonitor`] holds the online/offline flag and notifies
//! subscribers once per edge. [`ReachabilityProbe`] feeds it by polling a
//! health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::http::HttpTransport;
use crate::notify::{Notification, NotificationSink};
use crate::request::RequestDescriptor;

/// Current reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
  pub online: bool,
  /// Epoch milliseconds of the last edge (or of construction)
  pub last_transition: i64,
}

/// An observed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(Transition) + Send + Sync>;

/// Edge-triggered online/offline signal.
pub struct ConnectivityMonitor {
  tx: watch::Sender<ConnectionState>,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn NotificationSink>,
  subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
  next_id: AtomicU64,
}

impl ConnectivityMonitor {
  pub fn new(online: bool, clock: Arc<dyn Clock>, sink: Arc<dyn NotificationSink>) -> Self {
    let (tx, _) = watch::channel(ConnectionState {
      online,
      last_transition: clock.now_ms(),
    });
    Self {
      tx,
      clock,
      sink,
      subscribers: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn is_online(&self) -> bool {
    self.tx.borrow().online
  }

  pub fn state(&self) -> ConnectionState {
    *self.tx.borrow()
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<ConnectionState> {
    self.tx.subscribe()
  }

  /// Register `callback` to run on every edge. Callbacks run synchronously
  /// inside [`set_online`](Self::set_online) and must not block.
  pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
  where
    F: Fn(Transition) + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.subscribers().push((id, Arc::new(callback)));
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) {
    self.subscribers().retain(|(sub, _)| *sub != id);
  }

  /// Report the current reachability.
  ///
  /// Repeated reports of the same value are ignored; only an actual change
  /// notifies subscribers.
  pub fn set_online(&self, online: bool) -> Option<Transition> {
    let now = self.clock.now_ms();
    let changed = self.tx.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      state.online = online;
      state.last_transition = now;
      true
    });

    if !changed {
      debug!(online, "Connectivity unchanged");
      return None;
    }

    let transition = if online {
      info!("Connection restored");
      self.sink.notify(Notification::success(
        "Connection Restored",
        "You are back online. Syncing data...",
      ));
      Transition::WentOnline
    } else {
      info!("Connection lost");
      self.sink.notify(Notification::warning(
        "Connection Lost",
        "You are now offline. Data will be cached locally.",
      ));
      Transition::WentOffline
    };

    // Run callbacks outside the lock so they may (un)subscribe
    let callbacks: Vec<Callback> = self.subscribers().iter().map(|(_, cb)| cb.clone()).collect();
    for callback in callbacks {
      callback(transition);
    }

    Some(transition)
  }

  fn subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
    self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Check reachability once and report the result to `monitor`.
///
/// Any HTTP response counts as reachable, even an error status; only a
/// transport failure counts as offline.
pub async fn probe_once(
  monitor: &ConnectivityMonitor,
  http: &dyn HttpTransport,
  health: &RequestDescriptor,
) -> bool {
  let reachable = http.send(health).await.is_ok();
  monitor.set_online(reachable);
  reachable
}

/// Background task polling a health endpoint.
pub struct ReachabilityProbe {
  handle: JoinHandle<()>,
}

impl ReachabilityProbe {
  pub fn spawn(
    monitor: Arc<ConnectivityMonitor>,
    http: Arc<dyn HttpTransport>,
    health: RequestDescriptor,
    interval: Duration,
  ) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        probe_once(&monitor, http.as_ref(), &health).await;
      }
    });
    Self { handle }
  }

  pub fn stop(&self) {
    self.handle.abort();
  }
}

impl Drop for ReachabilityProbe {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::notify::{ChannelSink, Level};
  use crate::testing::FakeHttp;
  use std::sync::atomic::AtomicUsize;

  fn make_monitor(online: bool) -> (ConnectivityMonitor, ManualClock, ChannelSink) {
    let clock = ManualClock::new(100);
    let (sink, _rx) = ChannelSink::new();
    let monitor = ConnectivityMonitor::new(online, Arc::new(clock.clone()), Arc::new(sink.clone()));
    (monitor, clock, sink)
  }

  #[test]
  fn test_edges_fire_once() {
    let (monitor, clock, _) = make_monitor(false);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let fired_clone = fired.clone();
    monitor.subscribe(move |t| fired_clone.lock().unwrap().push(t));

    clock.advance(50);
    assert_eq!(monitor.set_online(true), Some(Transition::WentOnline));
    assert_eq!(monitor.set_online(true), None);
    assert_eq!(monitor.set_online(true), None);
    assert_eq!(monitor.state().last_transition, 150);

    assert_eq!(monitor.set_online(false), Some(Transition::WentOffline));
    assert_eq!(monitor.set_online(false), None);

    assert_eq!(
      *fired.lock().unwrap(),
      vec![Transition::WentOnline, Transition::WentOffline]
    );
  }

  #[test]
  fn test_unsubscribe_stops_callbacks() {
    let (monitor, _, _) = make_monitor(true);
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    let id = monitor.subscribe(move |_| {
      count_clone.fetch_add(1, Ordering::SeqCst);
    });

    monitor.set_online(false);
    monitor.unsubscribe(id);
    monitor.set_online(true);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_notifications_per_edge() {
    let clock = ManualClock::new(0);
    let (sink, mut rx) = ChannelSink::new();
    let monitor = ConnectivityMonitor::new(true, Arc::new(clock), Arc::new(sink));

    monitor.set_online(false);
    monitor.set_online(false);
    monitor.set_online(true);

    assert_eq!(rx.try_recv().unwrap().level, Level::Warning);
    assert_eq!(rx.try_recv().unwrap().title, "Connection Restored");
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_watch_observes_changes() {
    let (monitor, _, _) = make_monitor(false);
    let mut rx = monitor.watch();

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(rx.borrow().online);
  }

  #[tokio::test]
  async fn test_probe_once_follows_transport() {
    let (monitor, _, _) = make_monitor(true);
    let http = FakeHttp::new();
    let health = RequestDescriptor::get("/health");

    http.fail_network();
    assert!(!probe_once(&monitor, &http, &health).await);
    assert!(!monitor.is_online());

    // An error status still means the server is reachable
    http.respond(503, serde_json::json!({}));
    assert!(probe_once(&monitor, &http, &health).await);
    assert!(monitor.is_online());
  }
}
