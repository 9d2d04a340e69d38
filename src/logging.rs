//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{data_dir, LogConfig};

const LOG_FILE: &str = "learnsync.log";

/// Filter directives used when `RUST_LOG` is not set.
fn default_directives(config: &LogConfig, verbose: bool) -> String {
  if verbose {
    "learnsync=debug".to_string()
  } else {
    config.filter.clone()
  }
}

/// Install the global subscriber.
///
/// Logs go to a daily file in the data directory, or to stderr with
/// `verbose`. Keep the returned guard alive until exit so buffered lines are
/// flushed.
pub fn init(config: &LogConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
  let directives = default_directives(config, verbose);
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&directives))
    .map_err(|e| eyre!("Invalid log filter {}: {}", directives, e))?;

  if verbose {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to init logging: {}", e))?;
    return Ok(None);
  }

  let dir = data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;
  Ok(Some(guard))
}
