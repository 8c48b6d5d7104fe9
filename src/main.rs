//! offline-cache - network-first HTTP cache with an offline fallback.
//!
//! Pre-caches an offline manifest into a versioned cache generation, cleans
//! up stale generations on activation, and answers requests from the network
//! first, falling back to cached snapshots, an offline page, or a 503.

mod cache;
mod commands;
mod config;
mod net;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{OfflineCacheManager, SqliteStorage};
use net::HttpClient;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Network-first HTTP cache with versioned offline generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-cache.yaml or $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the manifest is served from
  #[arg(long)]
  origin: Option<String>,

  /// Cache generation name to use instead of the configured one
  #[arg(long)]
  cache_version: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Initialize the tracing subscriber for logging
///
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
fn init_tracing() -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = Some(origin);
  }
  if let Some(version) = args.cache_version {
    config.version = version;
  }

  let settings = config.manager_settings()?;
  let storage_path = config.storage_path()?;
  info!(
    path = %storage_path.display(),
    version = settings.version(),
    skip_waiting = settings.skip_waiting(),
    "Opening cache"
  );

  let store = Arc::new(SqliteStorage::open(&storage_path)?);
  let client = HttpClient::new()?;
  let manager = OfflineCacheManager::new(Arc::clone(&store), Arc::new(client.clone()), settings);

  commands::run(args.command, &manager, &client, &*store).await
}
