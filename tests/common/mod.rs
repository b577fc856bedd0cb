#![allow(dead_code)]

use futures::future::BoxFuture;
use offsync::channel::{ChannelError, Connection, Connector, Incoming};
use offsync::http::{HttpResponse, HttpTransport, TransportError};
use offsync::notify::ChannelSink;
use offsync::{
  Clock, DurableStore, ManualClock, Notification, OfflineService, RequestDescriptor,
  ServiceOptions,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Server stand-in that is either reachable (answering with a fixed status)
/// or down.
pub struct ToggleServer {
  up: AtomicBool,
  status: Mutex<u16>,
  received: Mutex<Vec<RequestDescriptor>>,
}

impl ToggleServer {
  pub fn new(up: bool) -> Arc<Self> {
    Arc::new(Self {
      up: AtomicBool::new(up),
      status: Mutex::new(200),
      received: Mutex::new(Vec::new()),
    })
  }

  pub fn set_up(&self, up: bool) {
    self.up.store(up, Ordering::SeqCst);
  }

  pub fn set_status(&self, status: u16) {
    *self.status.lock().unwrap() = status;
  }

  /// Requests that reached the server, health checks excluded.
  pub fn received(&self) -> Vec<RequestDescriptor> {
    self.received.lock().unwrap().clone()
  }
}

impl HttpTransport for ToggleServer {
  fn send<'a>(
    &'a self,
    request: &'a RequestDescriptor,
  ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
    Box::pin(async move {
      if !self.up.load(Ordering::SeqCst) {
        return Err(TransportError::Network("connection refused".into()));
      }
      if !request.url.ends_with("/health") {
        self.received.lock().unwrap().push(request.clone());
      }
      let status = *self.status.lock().unwrap();
      Ok(HttpResponse::new(status, serde_json::json!({ "ok": status < 400 })))
    })
  }
}

/// Connector whose sockets stay open until told otherwise.
#[derive(Default)]
pub struct LoopbackConnector {
  connects: AtomicUsize,
  peers: Mutex<Vec<mpsc::UnboundedSender<Incoming>>>,
}

impl LoopbackConnector {
  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }

  /// Break the most recent socket without a close frame.
  pub fn drop_latest(&self) {
    if let Some(peer) = self.peers.lock().unwrap().last() {
      let _ = peer.send(Incoming::Closed { code: None });
    }
  }

  pub fn push_latest(&self, frame: Value) {
    if let Some(peer) = self.peers.lock().unwrap().last() {
      let _ = peer.send(Incoming::Message(frame));
    }
  }
}

struct LoopbackConnection {
  incoming: mpsc::UnboundedReceiver<Incoming>,
}

impl Connection for LoopbackConnection {
  fn send(&mut self, _frame: Value) -> BoxFuture<'_, Result<(), ChannelError>> {
    Box::pin(async { Ok(()) })
  }

  fn recv(&mut self) -> BoxFuture<'_, Result<Incoming, ChannelError>> {
    Box::pin(async move {
      Ok(
        self
          .incoming
          .recv()
          .await
          .unwrap_or(Incoming::Closed { code: None }),
      )
    })
  }

  fn close(&mut self, _code: u16) -> BoxFuture<'_, Result<(), ChannelError>> {
    Box::pin(async { Ok(()) })
  }
}

impl Connector for LoopbackConnector {
  fn connect<'a>(
    &'a self,
    _endpoint: &'a str,
  ) -> BoxFuture<'a, Result<Box<dyn Connection>, ChannelError>> {
    Box::pin(async move {
      self.connects.fetch_add(1, Ordering::SeqCst);
      let (tx, rx) = mpsc::unbounded_channel();
      self.peers.lock().unwrap().push(tx);
      Ok(Box::new(LoopbackConnection { incoming: rx }) as Box<dyn Connection>)
    })
  }
}

pub struct Setup {
  pub service: OfflineService,
  pub server: Arc<ToggleServer>,
  pub connector: Arc<LoopbackConnector>,
  pub clock: ManualClock,
  pub notes: mpsc::UnboundedReceiver<Notification>,
}

impl Setup {
  pub fn titles(&mut self) -> Vec<String> {
    let mut titles = Vec::new();
    while let Ok(note) = self.notes.try_recv() {
      titles.push(note.title);
    }
    titles
  }
}

pub fn setup(online: bool, store: Arc<dyn DurableStore>) -> Setup {
  let server = ToggleServer::new(online);
  let connector = Arc::new(LoopbackConnector::default());
  let clock = ManualClock::new(1_700_000_000_000);
  let (sink, notes) = ChannelSink::new();
  let options = ServiceOptions {
    initially_online: online,
    startup_drain_delay: Duration::ZERO,
    ..ServiceOptions::default()
  };
  let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
  let service = OfflineService::init(
    options,
    store,
    server.clone(),
    connector.clone(),
    Arc::new(sink),
    shared_clock,
  );
  Setup {
    service,
    server,
    connector,
    clock,
    notes,
  }
}

/// Poll `condition` until it holds, failing after a second.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
  tokio::time::timeout(Duration::from_secs(1), async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("condition not reached in time");
}
