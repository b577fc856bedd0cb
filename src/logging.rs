use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "OFFSYNC_LOG";

const LOG_FILE_PREFIX: &str = "offsync.log";

/// Install a daily rolling file logger under `log_dir`.
///
/// The returned guard flushes buffered lines when dropped and must be kept
/// alive for the lifetime of the program.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(guard)
}

/// Default log directory: `<data_dir>/offsync/logs`.
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_local_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("offsync").join("logs"))
}
