//! Wiring of all offline components behind one explicit lifecycle.
//!
//! [`OfflineService::init`] builds the cache, queue, monitor, sync engine,
//! client and channel registry, loads persisted state and hooks reconnects
//! up to queue draining. [`OfflineService::dispose`] tears the background
//! work down again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::DurableCache;
use crate::channel::{ChannelPolicy, ChannelRegistry, Connector, ReconnectingChannel};
use crate::client::{ResilientClient, Response};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe, SubscriptionId, Transition};
use crate::error::FetchError;
use crate::http::HttpTransport;
use crate::notify::{Notification, NotificationSink};
use crate::queue::PendingQueue;
use crate::request::RequestDescriptor;
use crate::store::DurableStore;
use crate::sync::{DrainSummary, SyncEngine};

/// Tunables for [`OfflineService::init`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
  pub cache_ttl: Duration,
  pub max_retries: u32,
  pub channel: ChannelPolicy,
  /// Request used to check reachability
  pub health: RequestDescriptor,
  /// Polling period of the reachability probe; `None` disables it
  pub probe_interval: Option<Duration>,
  /// Connectivity assumed until the first report
  pub initially_online: bool,
  /// Replay persisted requests when starting online
  pub drain_on_start: bool,
  /// Wait before that startup replay
  pub startup_drain_delay: Duration,
}

impl Default for ServiceOptions {
  fn default() -> Self {
    Self {
      cache_ttl: Duration::from_secs(24 * 60 * 60),
      max_retries: 3,
      channel: ChannelPolicy::default(),
      health: RequestDescriptor::get("/api/common/system/health").uncached(),
      probe_interval: None,
      initially_online: true,
      drain_on_start: true,
      startup_drain_delay: Duration::from_secs(1),
    }
  }
}

/// What [`OfflineService::clear_offline_data`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearedData {
  pub cache_entries: usize,
  pub queued_requests: usize,
}

pub struct OfflineService {
  cache: Arc<DurableCache>,
  queue: Arc<PendingQueue>,
  monitor: Arc<ConnectivityMonitor>,
  sync: Arc<SyncEngine>,
  client: ResilientClient,
  channels: ChannelRegistry,
  http: Arc<dyn HttpTransport>,
  sink: Arc<dyn NotificationSink>,
  health: RequestDescriptor,
  probe: Mutex<Option<ReachabilityProbe>>,
  subscription: Mutex<Option<SubscriptionId>>,
  startup_drain: Mutex<Option<JoinHandle<DrainSummary>>>,
}

impl OfflineService {
  /// Build and start the service. Must be called from within a tokio
  /// runtime when the probe is enabled or queued requests are pending.
  pub fn init(
    options: ServiceOptions,
    store: Arc<dyn DurableStore>,
    http: Arc<dyn HttpTransport>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let cache = Arc::new(DurableCache::open(
      store.clone(),
      clock.clone(),
      options.cache_ttl,
    ));
    let queue = Arc::new(PendingQueue::open(store, clock.clone(), options.max_retries));
    let monitor = Arc::new(ConnectivityMonitor::new(
      options.initially_online,
      clock.clone(),
      sink.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
      queue.clone(),
      http.clone(),
      monitor.clone(),
      sink.clone(),
      clock,
    ));
    let client = ResilientClient::new(
      http.clone(),
      cache.clone(),
      queue.clone(),
      monitor.clone(),
      sink.clone(),
    );
    let channels = ChannelRegistry::new(options.channel, connector, sink.clone());

    let engine = Arc::downgrade(&sync);
    let subscription = monitor.subscribe(move |transition| {
      if transition != Transition::WentOnline {
        return;
      }
      if let Some(engine) = engine.upgrade() {
        spawn_drain(&engine, Duration::ZERO);
      }
    });

    info!(
      cached = cache.len(),
      queued = queue.len(),
      online = monitor.is_online(),
      "Offline service initialized"
    );

    let service = Self {
      cache,
      queue,
      monitor,
      sync,
      client,
      channels,
      http,
      sink,
      health: options.health,
      probe: Mutex::new(None),
      subscription: Mutex::new(Some(subscription)),
      startup_drain: Mutex::new(None),
    };

    if let Some(interval) = options.probe_interval {
      service.start_probe(interval);
    }

    if options.drain_on_start && service.monitor.is_online() && !service.queue.is_empty() {
      debug!(
        pending = service.queue.len(),
        "Pending requests found at startup, scheduling drain"
      );
      *service.startup_drain.lock().unwrap_or_else(|e| e.into_inner()) =
        spawn_drain(&service.sync, options.startup_drain_delay);
    }

    service
  }

  /// Start polling the health endpoint, replacing any running probe.
  pub fn start_probe(&self, interval: Duration) {
    let probe = ReachabilityProbe::spawn(
      self.monitor.clone(),
      self.http.clone(),
      self.health.clone(),
      interval,
    );
    if let Some(previous) = self.probe().replace(probe) {
      previous.stop();
    }
  }

  /// Check reachability once and update the monitor.
  pub async fn probe_now(&self) -> bool {
    crate::connectivity::probe_once(&self.monitor, self.http.as_ref(), &self.health).await
  }

  pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<Response, FetchError> {
    self.client.request(descriptor).await
  }

  /// See [`ResilientClient::request_debounced`].
  pub async fn request_debounced(
    &self,
    slot: &str,
    descriptor: &RequestDescriptor,
    delay: Duration,
  ) -> Option<Result<Response, FetchError>> {
    self.client.request_debounced(slot, descriptor, delay).await
  }

  pub async fn batch(
    &self,
    descriptors: &[RequestDescriptor],
    concurrency: usize,
  ) -> Vec<Result<Response, FetchError>> {
    self.client.batch(descriptors, concurrency).await
  }

  /// Drain the queue now and wait for the result.
  pub async fn sync_now(&self) -> DrainSummary {
    self.sync.drain().await
  }

  pub fn set_online(&self, online: bool) -> Option<Transition> {
    self.monitor.set_online(online)
  }

  pub fn open_channel(&self, endpoint: &str) -> ReconnectingChannel {
    self.channels.open(endpoint)
  }

  pub fn close_channel(&self, endpoint: &str) -> bool {
    self.channels.close(endpoint)
  }

  /// Remove every cached response and queued request.
  pub fn clear_offline_data(&self) -> ClearedData {
    let cleared = ClearedData {
      cache_entries: self.cache.clear(None),
      queued_requests: self.queue.clear(),
    };
    info!(
      cache_entries = cleared.cache_entries,
      queued_requests = cleared.queued_requests,
      "Offline data cleared"
    );
    self.sink.notify(Notification::info(
      "Offline Data Cleared",
      "All cached data and pending requests have been removed.",
    ));
    cleared
  }

  /// Stop background work: the probe, a pending startup drain, every
  /// channel and the reconnect hook. Safe to call more than once.
  pub fn dispose(&self) {
    if let Some(probe) = self.probe().take() {
      probe.stop();
    }
    let startup_drain = self
      .startup_drain
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(handle) = startup_drain {
      handle.abort();
    }
    self.channels.close_all();
    let subscription = self
      .subscription
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(id) = subscription {
      self.monitor.unsubscribe(id);
    }
    debug!("Offline service disposed");
  }

  pub fn cache(&self) -> &Arc<DurableCache> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<PendingQueue> {
    &self.queue
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn sync_engine(&self) -> &Arc<SyncEngine> {
    &self.sync
  }

  pub fn channels(&self) -> &ChannelRegistry {
    &self.channels
  }

  fn probe(&self) -> MutexGuard<'_, Option<ReachabilityProbe>> {
    self.probe.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Start a background drain after `delay` if a runtime is available.
fn spawn_drain(engine: &Arc<SyncEngine>, delay: Duration) -> Option<JoinHandle<DrainSummary>> {
  if tokio::runtime::Handle::try_current().is_err() {
    warn!("No async runtime available, drain deferred");
    return None;
  }
  Some(engine.trigger_after(delay))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::notify::ChannelSink;
  use crate::store::MemoryStore;
  use crate::testing::{FakeConnector, FakeHttp};
  use serde_json::json;

  fn init(
    online: bool,
    store: Arc<MemoryStore>,
    http: Arc<FakeHttp>,
  ) -> (OfflineService, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
    let (sink, notes) = ChannelSink::new();
    let options = ServiceOptions {
      initially_online: online,
      startup_drain_delay: Duration::ZERO,
      ..ServiceOptions::default()
    };
    let service = OfflineService::init(
      options,
      store,
      http,
      Arc::new(FakeConnector::new()),
      Arc::new(sink),
      Arc::new(ManualClock::new(10_000)),
    );
    (service, notes)
  }

  async fn wait_until_empty(queue: &PendingQueue) {
    tokio::time::timeout(Duration::from_secs(1), async {
      while !queue.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  #[tokio::test]
  async fn test_reconnect_drains_queue() {
    let http = Arc::new(FakeHttp::new());
    let (service, _notes) = init(false, Arc::new(MemoryStore::new()), http.clone());

    let err = service
      .request(&RequestDescriptor::post("/api/items", json!({"a": 1})))
      .await
      .unwrap_err();
    assert!(err.is_queued());
    assert_eq!(http.calls(), 0);

    service.set_online(true);
    wait_until_empty(service.queue()).await;
    assert_eq!(http.sent_urls(), vec!["/api/items"]);
    assert!(service.sync_engine().last_sync().is_some());
  }

  #[tokio::test]
  async fn test_startup_drain_of_persisted_queue() {
    let store = Arc::new(MemoryStore::new());
    let http = Arc::new(FakeHttp::new());
    {
      let (service, _) = init(false, store.clone(), http.clone());
      service
        .request(&RequestDescriptor::post("/api/items", json!({})))
        .await
        .unwrap_err();
      service.dispose();
    }

    let (service, _) = init(true, store, http.clone());
    wait_until_empty(service.queue()).await;
    assert_eq!(http.calls(), 1);
  }

  #[tokio::test]
  async fn test_dispose_stops_reconnect_drains() {
    let http = Arc::new(FakeHttp::new());
    let (service, _) = init(false, Arc::new(MemoryStore::new()), http.clone());
    service
      .request(&RequestDescriptor::post("/api/items", json!({})))
      .await
      .unwrap_err();

    service.dispose();
    service.dispose();
    service.set_online(true);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(service.queue().len(), 1);
    assert_eq!(http.calls(), 0);
  }

  #[tokio::test]
  async fn test_clear_offline_data() {
    let http = Arc::new(FakeHttp::new());
    let (service, mut notes) = init(true, Arc::new(MemoryStore::new()), http.clone());
    service.request(&RequestDescriptor::get("/api/a")).await.unwrap();
    service.set_online(false);
    service
      .request(&RequestDescriptor::post("/api/b", json!({})))
      .await
      .unwrap_err();

    let cleared = service.clear_offline_data();
    assert_eq!(
      cleared,
      ClearedData {
        cache_entries: 1,
        queued_requests: 1
      }
    );
    assert!(service.cache().is_empty());
    assert!(service.queue().is_empty());

    let mut titles = Vec::new();
    while let Ok(note) = notes.try_recv() {
      titles.push(note.title);
    }
    assert_eq!(titles.last().map(String::as_str), Some("Offline Data Cleared"));
  }

  #[tokio::test]
  async fn test_probe_now_updates_monitor() {
    let http = Arc::new(FakeHttp::new());
    let (service, _) = init(true, Arc::new(MemoryStore::new()), http.clone());

    http.fail_network();
    assert!(!service.probe_now().await);
    assert!(!service.monitor().is_online());
    assert_eq!(http.sent_urls(), vec!["/api/common/system/health"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_startup_drain_waits_for_delay() {
    let store = Arc::new(MemoryStore::new());
    let http = Arc::new(FakeHttp::new());
    {
      let (service, _) = init(false, store.clone(), http.clone());
      service
        .request(&RequestDescriptor::post("/api/items", json!({})))
        .await
        .unwrap_err();
      service.dispose();
    }

    let options = ServiceOptions {
      startup_drain_delay: Duration::from_secs(1),
      ..ServiceOptions::default()
    };
    let service = OfflineService::init(
      options,
      store,
      http.clone(),
      Arc::new(FakeConnector::new()),
      Arc::new(crate::notify::TracingSink),
      Arc::new(ManualClock::new(10_000)),
    );

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(http.calls(), 0);
    assert_eq!(service.queue().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(service.queue().is_empty());
    assert_eq!(http.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispose_cancels_pending_startup_drain() {
    let store = Arc::new(MemoryStore::new());
    let http = Arc::new(FakeHttp::new());
    {
      let (service, _) = init(false, store.clone(), http.clone());
      service
        .request(&RequestDescriptor::post("/api/items", json!({})))
        .await
        .unwrap_err();
      service.dispose();
    }

    let service = OfflineService::init(
      ServiceOptions::default(),
      store,
      http.clone(),
      Arc::new(FakeConnector::new()),
      Arc::new(crate::notify::TracingSink),
      Arc::new(ManualClock::new(10_000)),
    );
    service.dispose();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(service.queue().len(), 1);
    assert_eq!(http.calls(), 0);
  }
}
