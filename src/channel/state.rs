use std::fmt;
use std::time::Duration;

/// Lifecycle of a reconnecting channel.
///
/// ```text
/// Connecting --opened--> Open --peer/caller close--> Closing --> Closed
///     ^                   |                                      |
///     |                   +--error/abnormal close----------------+
///     +--------------------------backoff elapsed-----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Connecting,
  Open,
  Closing,
  Closed,
}

impl fmt::Display for ChannelState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ChannelState::Connecting => "connecting",
      ChannelState::Open => "open",
      ChannelState::Closing => "closing",
      ChannelState::Closed => "closed",
    };
    write!(f, "{}", s)
  }
}

/// Snapshot published by the driver on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
  pub state: ChannelState,
  /// Reconnection attempts since the last successful open
  pub retry_attempt: u32,
  /// No further reconnects will happen
  pub terminal: bool,
}

impl ChannelStatus {
  pub(crate) fn connecting(retry_attempt: u32) -> Self {
    Self {
      state: ChannelState::Connecting,
      retry_attempt,
      terminal: false,
    }
  }

  pub(crate) fn open() -> Self {
    Self {
      state: ChannelState::Open,
      retry_attempt: 0,
      terminal: false,
    }
  }

  pub(crate) fn closing(retry_attempt: u32) -> Self {
    Self {
      state: ChannelState::Closing,
      retry_attempt,
      terminal: false,
    }
  }

  /// Closed and waiting for the backoff to elapse.
  pub(crate) fn backing_off(retry_attempt: u32) -> Self {
    Self {
      state: ChannelState::Closed,
      retry_attempt,
      terminal: false,
    }
  }

  pub(crate) fn finished(retry_attempt: u32) -> Self {
    Self {
      state: ChannelState::Closed,
      retry_attempt,
      terminal: true,
    }
  }
}

/// Reconnection and heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
  pub base_delay: Duration,
  pub max_attempts: u32,
  pub heartbeat_interval: Duration,
}

impl Default for ChannelPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_millis(3000),
      max_attempts: 5,
      heartbeat_interval: Duration::from_secs(30),
    }
  }
}

impl ChannelPolicy {
  /// Delay before reconnect attempt `attempt` (zero-based): `base * 2^attempt`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor)
  }
}
