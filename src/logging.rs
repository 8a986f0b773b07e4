use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV_VAR: &str = "DOCDESK_LOG";
const LOG_FILE_PREFIX: &str = "docdesk.log";

/// Keeps the file writer flushing; drop it only at exit.
pub struct LoggingGuard {
  _file: WorkerGuard,
}

/// Directory holding the daily log files.
pub fn log_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join("docdesk").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

/// Install the global subscriber.
///
/// Filtering follows `DOCDESK_LOG` (default `info` for this crate, `warn`
/// elsewhere). `verbose` also echoes events to stderr; otherwise they only
/// go to the rolling file.
pub fn init(verbose: bool) -> Result<LoggingGuard> {
  let filter =
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn,docdesk=info"));

  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(LoggingGuard { _file: guard })
}
