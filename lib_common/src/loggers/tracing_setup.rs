//! # Tracing Setup
//!
//! Builds the process-wide `tracing` subscriber:
//! - an `EnvFilter` taken from `RUST_LOG`, falling back to the supplied level;
//! - a human readable console layer on stderr, so stdout stays free for
//!   machine readable output;
//! - a JSON file layer rotated daily under `log_dir`, written through a
//!   non-blocking appender.
//!
//! The returned `WorkerGuard` must be held for the lifetime of the program,
//! otherwise buffered file output is lost when it is dropped.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Errors raised while wiring the subscriber.
#[derive(Debug)]
pub enum LoggingError {
    /// The log directory could not be created.
    Io(std::io::Error),
    /// The filter directive was rejected.
    Filter(String),
    /// A global subscriber was already installed.
    AlreadyInitialized(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::Io(e) => write!(f, "Failed to prepare log directory: {}", e),
            LoggingError::Filter(e) => write!(f, "Invalid log filter: {}", e),
            LoggingError::AlreadyInitialized(e) => write!(f, "Logging already initialized: {}", e),
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Initializes console and file logging.
///
/// # Arguments
/// * `app_name` - Prefix of the rolling log files (`<app_name>.YYYY-MM-DD`).
/// * `log_dir` - Directory for the JSON log files; created when missing.
/// * `default_level` - Filter used when `RUST_LOG` is not set (e.g. `"info"`).
pub fn setup_logging(app_name: &str, log_dir: &Path, default_level: &str) -> Result<WorkerGuard, LoggingError> {
    // Create log directory if it doesn't exist
    std::fs::create_dir_all(log_dir).map_err(LoggingError::Io)?;

    // Configure file appender for rotating log files daily
    let file_appender = rolling::daily(log_dir, app_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| LoggingError::Filter(e.to_string()))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(app = app_name, dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_creates_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temporary directory");
        let log_dir = temp_dir.path().join("nested").join("logs");

        let guard = setup_logging("test_app", &log_dir, "debug");
        assert!(guard.is_ok());
        assert!(log_dir.is_dir());

        // A second global subscriber is refused rather than silently replacing the first.
        let second = setup_logging("test_app", &log_dir, "debug");
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized(_))));
    }
}
