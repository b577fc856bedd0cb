//! Self-healing push channel.
//!
//! A driver task owns the live [`Connection`] and walks the
//! [`ChannelState`] machine; callers hold cheap, clonable
//! [`ReconnectingChannel`] handles that observe state, receive events and
//! queue outbound frames.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::state::{ChannelPolicy, ChannelState, ChannelStatus};
use super::transport::{ChannelError, Connection, Connector, Incoming};
use crate::notify::{Notification, NotificationSink};

/// Close code for a normal, intentional shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

const EVENT_CAPACITY: usize = 64;

/// What consumers of a channel observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
  Opened,
  Message(Value),
  Closed { code: Option<u16> },
  /// Reconnect attempts exhausted; the channel is terminal.
  Abandoned,
}

/// Handle to a channel driven by a background task.
#[derive(Clone)]
pub struct ReconnectingChannel {
  endpoint: Arc<str>,
  status: watch::Receiver<ChannelStatus>,
  events: broadcast::Sender<ChannelEvent>,
  outbound: mpsc::UnboundedSender<Value>,
  close: Arc<watch::Sender<Option<u16>>>,
}

impl ReconnectingChannel {
  /// Start connecting to `endpoint` immediately.
  ///
  /// Events emitted before [`subscribe`](Self::subscribe) is called are not
  /// replayed; the current state is always available through
  /// [`status`](Self::status).
  pub fn spawn(
    endpoint: impl Into<String>,
    policy: ChannelPolicy,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
  ) -> Self {
    let endpoint: Arc<str> = Arc::from(endpoint.into());
    let (status_tx, status_rx) = watch::channel(ChannelStatus::connecting(0));
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(None);

    let driver = Driver {
      endpoint: endpoint.clone(),
      policy,
      connector,
      sink,
      status: status_tx,
      events: events.clone(),
      outbound: outbound_rx,
      close: close_rx,
    };
    tokio::spawn(driver.run());

    Self {
      endpoint,
      status: status_rx,
      events,
      outbound: outbound_tx,
      close: Arc::new(close_tx),
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn status(&self) -> ChannelStatus {
    *self.status.borrow()
  }

  pub fn state(&self) -> ChannelState {
    self.status().state
  }

  pub fn retry_attempt(&self) -> u32 {
    self.status().retry_attempt
  }

  /// Whether the channel is connected or still trying to be.
  pub fn is_live(&self) -> bool {
    !self.status().terminal
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
    self.events.subscribe()
  }

  pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
    self.status.clone()
  }

  /// Queue a frame for the open connection.
  pub fn send(&self, frame: Value) -> Result<(), ChannelError> {
    if self.state() != ChannelState::Open {
      return Err(ChannelError::Send(format!(
        "channel to {} is not open",
        self.endpoint
      )));
    }
    self
      .outbound
      .send(frame)
      .map_err(|_| ChannelError::Send("channel driver has stopped".to_string()))
  }

  /// Close the channel for good. Only the first call's code is used.
  pub fn close(&self, code: u16) {
    self.close.send_if_modified(|current| {
      if current.is_some() {
        return false;
      }
      *current = Some(code);
      true
    });
  }

  /// Wait until the channel is terminal.
  pub async fn closed(&self) {
    let mut status = self.status.clone();
    let _ = status.wait_for(|s| s.terminal).await;
  }

  /// Whether both handles drive the same connection.
  pub fn same_channel(&self, other: &ReconnectingChannel) -> bool {
    Arc::ptr_eq(&self.close, &other.close)
  }
}

impl std::fmt::Debug for ReconnectingChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReconnectingChannel")
      .field("endpoint", &self.endpoint)
      .field("status", &self.status())
      .finish()
  }
}

enum SessionEnd {
  /// Intentional close by either side; never reconnect
  Graceful,
  Abnormal,
}

struct Driver {
  endpoint: Arc<str>,
  policy: ChannelPolicy,
  connector: Arc<dyn Connector>,
  sink: Arc<dyn NotificationSink>,
  status: watch::Sender<ChannelStatus>,
  events: broadcast::Sender<ChannelEvent>,
  outbound: mpsc::UnboundedReceiver<Value>,
  close: watch::Receiver<Option<u16>>,
}

impl Driver {
  async fn run(mut self) {
    let mut attempt = 0u32;

    loop {
      if self.close_requested().is_some() {
        self.finish_requested(attempt);
        return;
      }
      self.publish(ChannelStatus::connecting(attempt));
      debug!(endpoint = %self.endpoint, attempt, "Connecting");

      let connected = tokio::select! {
        result = self.connector.connect(&self.endpoint) => Some(result),
        _ = self.close.changed() => None,
      };

      let end = match connected {
        None => {
          self.finish_requested(attempt);
          return;
        }
        Some(Ok(conn)) => {
          attempt = 0;
          self.session(conn).await
        }
        Some(Err(e)) => {
          warn!(endpoint = %self.endpoint, error = %e, "Channel connect failed");
          SessionEnd::Abnormal
        }
      };

      if let SessionEnd::Graceful = end {
        self.finish(attempt);
        return;
      }
      self.discard_outbound();

      if attempt >= self.policy.max_attempts {
        self.abandon(attempt);
        return;
      }

      let delay = self.policy.backoff(attempt);
      info!(
        endpoint = %self.endpoint,
        attempt = attempt + 1,
        max_attempts = self.policy.max_attempts,
        delay_ms = delay.as_millis() as u64,
        "Reconnecting after backoff"
      );
      self.publish(ChannelStatus::backing_off(attempt));

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = self.close.changed() => {
          self.finish_requested(attempt);
          return;
        }
      }
      attempt += 1;
    }
  }

  /// Drive one open connection until it ends.
  async fn session(&mut self, mut conn: Box<dyn Connection>) -> SessionEnd {
    info!(endpoint = %self.endpoint, "Channel open");
    self.publish(ChannelStatus::open());
    self.emit(ChannelEvent::Opened);

    let period = self.policy.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        incoming = conn.recv() => match incoming {
          Ok(Incoming::Message(value)) => {
            if is_pong(&value) {
              debug!(endpoint = %self.endpoint, "Heartbeat acknowledged");
              continue;
            }
            self.emit(ChannelEvent::Message(value));
          }
          Ok(Incoming::Closed { code: Some(NORMAL_CLOSE) }) => {
            info!(endpoint = %self.endpoint, "Peer closed channel normally");
            self.emit(ChannelEvent::Closed { code: Some(NORMAL_CLOSE) });
            return SessionEnd::Graceful;
          }
          Ok(Incoming::Closed { code }) => {
            warn!(endpoint = %self.endpoint, ?code, "Channel closed unexpectedly");
            self.emit(ChannelEvent::Closed { code });
            return SessionEnd::Abnormal;
          }
          Err(e) => {
            warn!(endpoint = %self.endpoint, error = %e, "Channel receive failed");
            self.emit(ChannelEvent::Closed { code: None });
            return SessionEnd::Abnormal;
          }
        },
        _ = heartbeat.tick() => {
          if let Err(e) = conn.send(json!({ "type": "ping" })).await {
            warn!(endpoint = %self.endpoint, error = %e, "Heartbeat failed");
            self.emit(ChannelEvent::Closed { code: None });
            return SessionEnd::Abnormal;
          }
        }
        Some(frame) = self.outbound.recv() => {
          if let Err(e) = conn.send(frame).await {
            warn!(endpoint = %self.endpoint, error = %e, "Channel send failed");
            self.emit(ChannelEvent::Closed { code: None });
            return SessionEnd::Abnormal;
          }
        }
        _ = self.close.changed() => {
          let code = self.close_requested().unwrap_or(NORMAL_CLOSE);
          self.publish(ChannelStatus::closing(0));
          if let Err(e) = conn.close(code).await {
            debug!(endpoint = %self.endpoint, error = %e, "Close handshake failed");
          }
          self.emit(ChannelEvent::Closed { code: Some(code) });
          return SessionEnd::Graceful;
        }
      }
    }
  }

  /// Close requested through a handle. Dropping every handle counts as a
  /// normal close.
  fn close_requested(&self) -> Option<u16> {
    if self.close.has_changed().is_err() {
      return Some(NORMAL_CLOSE);
    }
    *self.close.borrow()
  }

  fn finish(&self, attempt: u32) {
    debug!(endpoint = %self.endpoint, "Channel closed");
    self.publish(ChannelStatus::finished(attempt));
  }

  /// Close requested while no connection was open.
  fn finish_requested(&self, attempt: u32) {
    let code = self.close_requested().unwrap_or(NORMAL_CLOSE);
    self.emit(ChannelEvent::Closed { code: Some(code) });
    self.finish(attempt);
  }

  /// Frames accepted for a connection that has since died are not carried
  /// over to the next one.
  fn discard_outbound(&mut self) {
    let mut dropped = 0usize;
    while self.outbound.try_recv().is_ok() {
      dropped += 1;
    }
    if dropped > 0 {
      warn!(endpoint = %self.endpoint, dropped, "Discarded unsent frames");
    }
  }

  fn abandon(&self, attempt: u32) {
    error!(
      endpoint = %self.endpoint,
      attempts = attempt,
      "Giving up on channel after repeated failures"
    );
    self.publish(ChannelStatus::finished(attempt));
    self.emit(ChannelEvent::Abandoned);
    self.sink.notify(Notification::error(
      "Connection Failed",
      "Unable to establish real-time connection.",
    ));
  }

  fn publish(&self, status: ChannelStatus) {
    self.status.send_replace(status);
  }

  fn emit(&self, event: ChannelEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

fn is_pong(frame: &Value) -> bool {
  frame.get("type").and_then(Value::as_str) == Some("pong")
}
