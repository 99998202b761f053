//! Logging setup for CLI commands and `serve`

use std::path::PathBuf;

use lambdev::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "lambdev.log";

/// Directory holding the log files (respects env vars)
pub fn log_dir() -> PathBuf {
  lambdev::dirs::default_data_dir()
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

fn env_filter(config: &LogConfig) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy()
}

/// Console logging for one-shot commands. Logs go to stderr so stdout stays
/// free for function output.
pub fn init_cli_logging(config: &LogConfig) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_writer(std::io::stderr)
    .init();
}

/// Logging for `serve`.
///
/// Console with colors by default. With `to_file`, logs go to a rolling file
/// in the data directory instead, rotated per `log.rotation`.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_serve_logging(config: &LogConfig, to_file: bool) -> Option<WorkerGuard> {
  if !to_file {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter(config))
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let log_directory = log_dir();
  if std::fs::create_dir_all(&log_directory).is_err() {
    // Fall back to console-only logging
    init_cli_logging(config);
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_directory, LOG_FILE_NAME),
    "never" => tracing_appender::rolling::never(&log_directory, LOG_FILE_NAME),
    _ => tracing_appender::rolling::daily(&log_directory, LOG_FILE_NAME),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
