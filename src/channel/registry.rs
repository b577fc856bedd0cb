use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::reconnecting::{ReconnectingChannel, NORMAL_CLOSE};
use super::state::ChannelPolicy;
use super::transport::Connector;
use crate::notify::NotificationSink;

/// At most one live channel per endpoint.
pub struct ChannelRegistry {
  policy: ChannelPolicy,
  connector: Arc<dyn Connector>,
  sink: Arc<dyn NotificationSink>,
  channels: Mutex<HashMap<String, ReconnectingChannel>>,
}

impl ChannelRegistry {
  pub fn new(
    policy: ChannelPolicy,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
  ) -> Self {
    Self {
      policy,
      connector,
      sink,
      channels: Mutex::new(HashMap::new()),
    }
  }

  /// Channel for `endpoint`, reusing one that is connected or still
  /// reconnecting. Terminal channels are replaced.
  pub fn open(&self, endpoint: &str) -> ReconnectingChannel {
    let mut channels = self.channels();
    if let Some(existing) = channels.get(endpoint) {
      if existing.is_live() {
        debug!(endpoint, state = %existing.state(), "Reusing channel");
        return existing.clone();
      }
    }

    let channel = ReconnectingChannel::spawn(
      endpoint,
      self.policy,
      self.connector.clone(),
      self.sink.clone(),
    );
    channels.insert(endpoint.to_string(), channel.clone());
    channel
  }

  /// Close the channel for `endpoint` with a normal close code.
  pub fn close(&self, endpoint: &str) -> bool {
    match self.channels().remove(endpoint) {
      Some(channel) => {
        channel.close(NORMAL_CLOSE);
        true
      }
      None => false,
    }
  }

  pub fn close_all(&self) {
    let drained: Vec<ReconnectingChannel> = self.channels().drain().map(|(_, c)| c).collect();
    for channel in drained {
      channel.close(NORMAL_CLOSE);
    }
  }

  /// Endpoints with a live channel.
  pub fn active(&self) -> Vec<String> {
    let mut endpoints: Vec<String> = self
      .channels()
      .iter()
      .filter(|(_, c)| c.is_live())
      .map(|(endpoint, _)| endpoint.clone())
      .collect();
    endpoints.sort();
    endpoints
  }

  fn channels(&self) -> MutexGuard<'_, HashMap<String, ReconnectingChannel>> {
    self.channels.lock().unwrap_or_else(|e| e.into_inner())
  }
}
