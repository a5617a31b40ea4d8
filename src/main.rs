use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use refcache::cache::{age_display, now_millis, CacheStore};
use refcache::Config;

/// How long to let background revalidation finish before exiting
const BACKGROUND_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "refcache")]
#[command(about = "Offline-first cache for rule and perk reference content")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/refcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load a resource (cache, then bundle, then remote) and print it
  Load {
    resource_id: String,
    /// Seconds to wait for a background update after printing
    #[arg(long, default_value_t = 0)]
    watch: u64,
  },
  /// Fetch a resource from the remote authority, bypassing freshness checks
  Refresh { resource_id: String },
  /// Clear one cached resource, or the whole cache
  Clear { resource_id: Option<String> },
  /// Show cache statistics
  Stats,
}

/// Initialize the tracing subscriber. Use RUST_LOG to control the level.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "refcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_deref());

  let config = Config::load(args.config.as_deref())?;
  info!(command = ?args.command, "refcache starting");

  match args.command {
    Command::Load { resource_id, watch } => load(&config, &resource_id, watch).await,
    Command::Refresh { resource_id } => refresh(&config, &resource_id).await,
    Command::Clear { resource_id } => {
      let store = CacheStore::new(config.open_storage()?);
      match resource_id.as_deref() {
        Some(id) => store.invalidate(id),
        None => store.invalidate_all(),
      }
      Ok(())
    }
    Command::Stats => stats(&config),
  }
}

async fn load(config: &Config, resource_id: &str, watch: u64) -> Result<()> {
  let sync = config.orchestrator()?;
  let mut updates = sync.subscribe();

  let loaded = sync.load_with_source(resource_id).await?;
  let age = loaded
    .fetched_at
    .map(|at| format!(", cached {}", age_display(at, now_millis())))
    .unwrap_or_default();
  eprintln!(
    "{} {} from {}{}",
    resource_id,
    loaded.payload.version,
    loaded.source.label(),
    age
  );
  println!("{}", serde_json::to_string_pretty(&loaded.payload)?);

  if watch > 0 {
    match tokio::time::timeout(Duration::from_secs(watch), updates.recv()).await {
      Ok(Ok(update)) => {
        eprintln!("{} updated to {}", update.resource_id, update.payload.version);
        println!("{}", serde_json::to_string_pretty(&update.payload)?);
      }
      Ok(Err(e)) => debug!(error = %e, "Update channel closed"),
      Err(_) => eprintln!("No update within {}s", watch),
    }
  }

  if tokio::time::timeout(BACKGROUND_GRACE, sync.wait_idle()).await.is_err() {
    debug!("Background fetch still pending at exit");
  }

  Ok(())
}

async fn refresh(config: &Config, resource_id: &str) -> Result<()> {
  let sync = config.orchestrator()?;

  match sync.force_refresh(resource_id).await {
    Some(payload) => {
      eprintln!("{} refreshed to {}", resource_id, payload.version);
      println!("{}", serde_json::to_string_pretty(&payload)?);
      Ok(())
    }
    None => Err(color_eyre::eyre::eyre!(
      "Refresh of '{}' failed; cached content left unchanged",
      resource_id
    )),
  }
}

fn stats(config: &Config) -> Result<()> {
  let store = CacheStore::new(config.open_storage()?);
  let stats = store.stats();
  let now = now_millis();

  println!("entries:     {}", stats.count);
  println!("total bytes: {}", stats.total_bytes);
  if let Some(oldest) = stats.oldest_fetched_at {
    println!("oldest:      {}", age_display(oldest, now));
  }
  if let Some(newest) = stats.newest_fetched_at {
    println!("newest:      {}", age_display(newest, now));
  }

  for resource_id in store.index().files.keys() {
    if let Some(entry) = store.read(resource_id) {
      let state = if entry.is_fresh() { "fresh" } else { "stale" };
      let fetched = entry
        .fetched_at_utc()
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
      println!(
        "  {:<24} {:<16} {:<6} {:<20} {}",
        resource_id,
        entry.payload.version,
        state,
        fetched,
        entry.age_display()
      );
    }
  }

  Ok(())
}
