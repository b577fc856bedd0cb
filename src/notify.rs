//! User-facing status notifications.
//!
//! The subsystem reports things like "connection restored" or "3 requests
//! synced" through a [`NotificationSink`]. How a sink renders them is up to the
//! embedding application.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Info,
  Success,
  Warning,
  Error,
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Level::Info => "info",
      Level::Success => "success",
      Level::Warning => "warning",
      Level::Error => "error",
    };
    f.write_str(s)
  }
}

/// A single status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub level: Level,
  pub title: String,
  pub message: String,
}

impl Notification {
  pub fn new(level: Level, title: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      level,
      title: title.into(),
      message: message.into(),
    }
  }

  pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(Level::Info, title, message)
  }

  pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(Level::Success, title, message)
  }

  pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(Level::Warning, title, message)
  }

  pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(Level::Error, title, message)
  }
}

/// Receiver of notifications. Implementations must not block.
pub trait NotificationSink: Send + Sync {
  fn notify(&self, notification: Notification);
}

/// Sink that writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn notify(&self, n: Notification) {
    match n.level {
      Level::Info | Level::Success => info!(title = %n.title, "{}", n.message),
      Level::Warning => warn!(title = %n.title, "{}", n.message),
      Level::Error => error!(title = %n.title, "{}", n.message),
    }
  }
}

/// Sink that forwards notifications over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl NotificationSink for ChannelSink {
  fn notify(&self, notification: Notification) {
    // Receiver may have been dropped
    let _ = self.tx.send(notification);
  }
}
