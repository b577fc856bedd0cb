use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offsync::channel::{ChannelEvent, WebSocketConnector, NORMAL_CLOSE};
use offsync::notify::ChannelSink;
use offsync::{
  Config, FetchError, HttpTransport, Method, Notification, OfflineService, ReqwestTransport,
  RequestDescriptor, Response, SqliteStore, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-resilient REST client with a durable cache and replay queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a resource, falling back to the cache when offline
  Get {
    path: String,
    /// Bypass the cache entirely
    #[arg(long)]
    no_cache: bool,
  },
  /// Send a mutation; queued for later when offline
  Send {
    method: Method,
    path: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Inspect or replay queued requests
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Inspect or clear cached responses
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Follow a push channel until interrupted
  Watch { endpoint: String },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Drain,
  Clear,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Stats,
  /// Remove all entries, or those whose key contains PATTERN
  Clear { pattern: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = offsync::logging::init(&offsync::logging::default_log_dir()?)?;

  let store_path = match &config.cache.path {
    Some(path) => path.clone(),
    None => SqliteStore::default_path()?,
  };
  let store = Arc::new(SqliteStore::open(&store_path)?);
  let http: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
    &config.api.base_url,
    config.request_timeout(),
    Config::get_api_token(),
  )?);

  let mut options = config.service_options();
  // Replays are driven explicitly so they finish before the process exits
  options.drain_on_start = false;
  options.initially_online = http.send(&options.health).await.is_ok();
  if !matches!(args.command, Command::Watch { .. }) {
    options.probe_interval = None;
  }

  let (sink, mut notes) = ChannelSink::new();
  let service = OfflineService::init(
    options,
    store,
    http,
    Arc::new(WebSocketConnector),
    Arc::new(sink),
    Arc::new(SystemClock),
  );

  let result = run(&service, args.command, &mut notes).await;
  service.dispose();
  print_notifications(&mut notes);
  result
}

async fn run(
  service: &OfflineService,
  command: Command,
  notes: &mut UnboundedReceiver<Notification>,
) -> Result<()> {
  match command {
    Command::Get { path, no_cache } => {
      replay_pending(service).await;
      let mut request = RequestDescriptor::get(path);
      if no_cache {
        request = request.uncached();
      }
      print_outcome(service.request(&request).await)
    }
    Command::Send { method, path, body } => {
      replay_pending(service).await;
      let mut request = RequestDescriptor::new(method, path);
      if let Some(body) = body {
        let value = serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON body: {}", e))?;
        request = request.with_body(value);
      }
      print_outcome(service.request(&request).await)
    }
    Command::Queue(QueueCommand::List) => {
      let pending = service.queue().list();
      if pending.is_empty() {
        println!("No pending requests");
      }
      for item in pending {
        println!(
          "{}  {:<6} {}  retries {}/{}",
          item.id, item.method, item.url, item.retry_count, item.max_retries
        );
      }
      Ok(())
    }
    Command::Queue(QueueCommand::Drain) => {
      if !service.monitor().is_online() {
        return Err(eyre!("Server unreachable, nothing was replayed"));
      }
      let summary = service.sync_now().await;
      println!(
        "synced {}, failed {}, still queued {}",
        summary.succeeded_count(),
        summary.failed_count(),
        summary.retained
      );
      for failure in &summary.failed {
        println!(
          "  dropped {} {} {}: {:?}",
          failure.request.id, failure.request.method, failure.request.url, failure.reason
        );
      }
      Ok(())
    }
    Command::Queue(QueueCommand::Clear) => {
      println!("Removed {} pending requests", service.queue().clear());
      Ok(())
    }
    Command::Cache(CacheCommand::Stats) => {
      let stats = service.cache().stats();
      println!("entries: {}", stats.entries);
      println!("expired: {}", stats.expired);
      if stats.degraded {
        println!("storage: memory only (writes failing)");
      }
      for key in stats.keys {
        println!("  {}", key);
      }
      Ok(())
    }
    Command::Cache(CacheCommand::Clear { pattern }) => {
      let removed = service.cache().clear(pattern.as_deref());
      println!("Removed {} cache entries", removed);
      Ok(())
    }
    Command::Watch { endpoint } => watch(service, &endpoint, notes).await,
  }
}

/// Replay anything queued by earlier runs before issuing a new request.
async fn replay_pending(service: &OfflineService) {
  if service.monitor().is_online() && !service.queue().is_empty() {
    service.sync_now().await;
  }
}

async fn watch(
  service: &OfflineService,
  endpoint: &str,
  notes: &mut UnboundedReceiver<Notification>,
) -> Result<()> {
  let channel = service.open_channel(endpoint);
  let mut events = channel.subscribe();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        channel.close(NORMAL_CLOSE);
        let _ = tokio::time::timeout(Duration::from_secs(2), channel.closed()).await;
        return Ok(());
      }
      Some(note) = notes.recv() => print_notification(&note),
      event = events.recv() => match event {
        Ok(ChannelEvent::Opened) => eprintln!("connected to {}", endpoint),
        Ok(ChannelEvent::Message(value)) => println!("{}", value),
        Ok(ChannelEvent::Closed { code }) => match code {
          Some(NORMAL_CLOSE) => {
            eprintln!("server closed the channel");
            return Ok(());
          }
          code => eprintln!("disconnected (code {:?}), reconnecting", code),
        },
        Ok(ChannelEvent::Abandoned) => {
          return Err(eyre!("Gave up reconnecting to {}", endpoint));
        }
        Err(e) => eprintln!("missed events: {}", e),
      },
    }
  }
}

fn print_outcome(outcome: Result<Response, FetchError>) -> Result<()> {
  match outcome {
    Ok(response) => {
      if let offsync::ResponseSource::Cache { stored_at, .. } = response.source {
        let stored = chrono::DateTime::from_timestamp_millis(stored_at)
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| stored_at.to_string());
        eprintln!("(served from cache, stored {})", stored);
      }
      println!("{}", serde_json::to_string_pretty(&response.body)?);
      Ok(())
    }
    Err(FetchError::Queued { id }) => {
      eprintln!("offline: request queued as {}", id);
      Ok(())
    }
    Err(e) => Err(eyre!(e)),
  }
}

fn print_notifications(notes: &mut UnboundedReceiver<Notification>) {
  while let Ok(note) = notes.try_recv() {
    print_notification(&note);
  }
}

fn print_notification(note: &Notification) {
  eprintln!("[{}] {}: {}", note.level, note.title, note.message);
}
