//! # Configuration Modules
//!
//! This module aggregates configuration providers. The tooling is configured
//! through environment variables (optionally seeded from a `.env` file), so
//! the helpers here focus on reading those variables without ever failing a
//! run over a malformed tuning knob.

/// Provides `.env` loading and tolerant parsing of numeric environment values.
pub mod env_config;

pub use env_config::{env_string, load_dotenv, parse_positive, parse_ratio};
