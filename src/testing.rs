//! Test doubles shared by the unit test modules.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, Connection, Connector, Incoming};
use crate::http::{HttpResponse, HttpTransport, TransportError};
use crate::request::RequestDescriptor;
use crate::store::DurableStore;

/// Store whose writes always fail.
pub struct FailingStore;

impl DurableStore for FailingStore {
  fn load(&self, _key: &str) -> Result<Option<String>> {
    Ok(None)
  }

  fn save(&self, key: &str, _value: &str) -> Result<()> {
    Err(eyre!("disk full while writing {}", key))
  }

  fn remove(&self, key: &str) -> Result<()> {
    Err(eyre!("disk full while removing {}", key))
  }
}

type Outcome = Result<HttpResponse, TransportError>;

/// Scripted HTTP transport.
///
/// One-shot outcomes pushed with `push_*` are consumed first, in order;
/// after that every call gets the fallback set by `respond`/`fail_network`
/// (200 with a null body by default).
pub struct FakeHttp {
  script: Mutex<VecDeque<Outcome>>,
  fallback: Mutex<Outcome>,
  sent: Mutex<Vec<RequestDescriptor>>,
  delay: Mutex<Option<Duration>>,
}

impl FakeHttp {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback: Mutex::new(Ok(HttpResponse::new(200, Value::Null))),
      sent: Mutex::new(Vec::new()),
      delay: Mutex::new(None),
    }
  }

  pub fn respond(&self, status: u16, body: Value) {
    *self.fallback.lock().unwrap() = Ok(HttpResponse::new(status, body));
  }

  pub fn fail_network(&self) {
    *self.fallback.lock().unwrap() = Err(TransportError::Network("connection refused".into()));
  }

  pub fn fail_with(&self, error: TransportError) {
    *self.fallback.lock().unwrap() = Err(error);
  }

  pub fn push_response(&self, status: u16, body: Value) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Ok(HttpResponse::new(status, body)));
  }

  pub fn push_failure(&self) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Err(TransportError::Network("connection reset".into())));
  }

  /// Make every call wait before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> usize {
    self.sent.lock().unwrap().len()
  }

  pub fn sent(&self) -> Vec<RequestDescriptor> {
    self.sent.lock().unwrap().clone()
  }

  pub fn sent_urls(&self) -> Vec<String> {
    self.sent().into_iter().map(|r| r.url).collect()
  }
}

impl HttpTransport for FakeHttp {
  fn send<'a>(&'a self, request: &'a RequestDescriptor) -> BoxFuture<'a, Outcome> {
    self.sent.lock().unwrap().push(request.clone());
    let outcome = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
    let delay = *self.delay.lock().unwrap();
    Box::pin(async move {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      outcome
    })
  }
}

/// Test side of a fake channel connection.
pub struct FakePeer {
  incoming: mpsc::UnboundedSender<Result<Incoming, ChannelError>>,
  sent: Arc<Mutex<Vec<Value>>>,
  closed_with: Arc<Mutex<Option<u16>>>,
}

impl FakePeer {
  pub fn push(&self, frame: Value) {
    let _ = self.incoming.send(Ok(Incoming::Message(frame)));
  }

  pub fn close(&self, code: Option<u16>) {
    let _ = self.incoming.send(Ok(Incoming::Closed { code }));
  }

  pub fn fail(&self) {
    let _ = self
      .incoming
      .send(Err(ChannelError::Receive("connection reset".into())));
  }

  /// Frames the channel wrote to this connection.
  pub fn sent(&self) -> Vec<Value> {
    self.sent.lock().unwrap().clone()
  }

  pub fn closed_with(&self) -> Option<u16> {
    *self.closed_with.lock().unwrap()
  }
}

struct FakeConnection {
  incoming: mpsc::UnboundedReceiver<Result<Incoming, ChannelError>>,
  sent: Arc<Mutex<Vec<Value>>>,
  closed_with: Arc<Mutex<Option<u16>>>,
}

impl Connection for FakeConnection {
  fn send(&mut self, frame: Value) -> BoxFuture<'_, Result<(), ChannelError>> {
    self.sent.lock().unwrap().push(frame);
    Box::pin(async { Ok(()) })
  }

  fn recv(&mut self) -> BoxFuture<'_, Result<Incoming, ChannelError>> {
    Box::pin(async move {
      match self.incoming.recv().await {
        Some(next) => next,
        // Peer handle dropped
        None => Ok(Incoming::Closed { code: None }),
      }
    })
  }

  fn close(&mut self, code: u16) -> BoxFuture<'_, Result<(), ChannelError>> {
    *self.closed_with.lock().unwrap() = Some(code);
    Box::pin(async { Ok(()) })
  }
}

/// Connector that hands out scripted connections in order and refuses once
/// the script runs out.
pub struct FakeConnector {
  script: Mutex<VecDeque<FakeConnection>>,
  attempts: AtomicUsize,
}

impl FakeConnector {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      attempts: AtomicUsize::new(0),
    }
  }

  /// Let the next connect succeed and return the test side of it.
  pub fn accept(&self) -> FakePeer {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed_with = Arc::new(Mutex::new(None));
    self.script.lock().unwrap().push_back(FakeConnection {
      incoming: rx,
      sent: sent.clone(),
      closed_with: closed_with.clone(),
    });
    FakePeer {
      incoming: tx,
      sent,
      closed_with,
    }
  }

  pub fn attempts(&self) -> usize {
    self.attempts.load(Ordering::SeqCst)
  }
}

impl Connector for FakeConnector {
  fn connect<'a>(
    &'a self,
    endpoint: &'a str,
  ) -> BoxFuture<'a, Result<Box<dyn Connection>, ChannelError>> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    let next = self.script.lock().unwrap().pop_front();
    Box::pin(async move {
      match next {
        Some(conn) => Ok(Box::new(conn) as Box<dyn Connection>),
        None => Err(ChannelError::ConnectionFailed(format!(
          "{} refused",
          endpoint
        ))),
      }
    })
  }
}
