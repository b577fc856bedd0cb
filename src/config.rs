use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::ChannelPolicy;
use crate::request::RequestDescriptor;
use crate::service::ServiceOptions;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub connectivity: ConnectivityConfig,
  pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000".to_string(),
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  /// Default lifetime of cached reads
  pub ttl_secs: u64,
  /// SQLite file; defaults to the platform data directory
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 24 * 60 * 60,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
  /// Replay attempts before a queued request is dropped
  pub max_retries: u32,
  /// Wait before replaying requests left over from a previous run
  pub startup_drain_delay_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      startup_drain_delay_ms: 1_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub health_path: String,
  /// Reachability polling period; 0 disables polling
  pub probe_interval_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      health_path: "/api/common/system/health".to_string(),
      probe_interval_ms: 5_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
  pub base_delay_ms: u64,
  pub max_attempts: u32,
  pub heartbeat_interval_ms: u64,
}

impl Default for ChannelConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: 3_000,
      max_attempts: 5,
      heartbeat_interval_ms: 30_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // serde_yaml reads an empty document as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Bearer token for live requests, from OFFSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  pub fn channel_policy(&self) -> ChannelPolicy {
    ChannelPolicy {
      base_delay: Duration::from_millis(self.channel.base_delay_ms),
      max_attempts: self.channel.max_attempts,
      heartbeat_interval: Duration::from_millis(self.channel.heartbeat_interval_ms.max(1)),
    }
  }

  pub fn service_options(&self) -> ServiceOptions {
    let probe_interval = (self.connectivity.probe_interval_ms > 0)
      .then(|| Duration::from_millis(self.connectivity.probe_interval_ms));
    ServiceOptions {
      cache_ttl: Duration::from_secs(self.cache.ttl_secs),
      max_retries: self.queue.max_retries,
      channel: self.channel_policy(),
      health: RequestDescriptor::get(self.connectivity.health_path.clone()).uncached(),
      probe_interval,
      initially_online: true,
      drain_on_start: true,
      startup_drain_delay: Duration::from_millis(self.queue.startup_drain_delay_ms),
    }
  }
}
