//! # Loggers Module
//!
//! Logging for every binary goes through `tracing`. This module owns the
//! subscriber wiring so each tool only decides its application name and
//! log directory.

/// Configures console and rolling JSON file output for `tracing`.
pub mod tracing_setup;

pub use tracing_setup::{setup_logging, LoggingError};
