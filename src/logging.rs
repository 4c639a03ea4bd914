use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "OFFGRID_LOG";

fn directives(from_env: Option<String>, config: &LoggingConfig) -> String {
  from_env
    .filter(|d| !d.trim().is_empty())
    .unwrap_or_else(|| config.level.clone())
}

fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
  let directives = directives(std::env::var(LOG_ENV).ok(), config);
  EnvFilter::try_new(&directives).map_err(|e| eyre!("Invalid log filter '{}': {}", directives, e))
}

/// Install the global subscriber.
///
/// Logs go to stderr, or to a daily-rolling file when a directory is
/// configured. In the latter case the returned guard must be kept alive for
/// buffered lines to be flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = filter(config)?;

  let Some(directory) = &config.directory else {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  };

  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix(&config.file_prefix)
    .build(directory)
    .map_err(|e| eyre!("Failed to open log directory {}: {}", directory.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  info!("Logging to {}", directory.display());
  Ok(Some(guard))
}
