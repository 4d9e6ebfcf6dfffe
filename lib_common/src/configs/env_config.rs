//! # Environment Configuration
//!
//! Tuning knobs are read from the process environment. A knob that is absent,
//! empty or out of range silently falls back to its default: only explicit
//! run arguments are allowed to abort a process at startup.

use std::env;
use std::path::PathBuf;

/// Loads a `.env` file from the current directory or its ancestors.
///
/// Returns the path that was loaded, or `None` when no file was found.
/// Variables already present in the environment are never overwritten.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Parses a strictly positive integer, returning `fallback` when the raw value
/// is missing, unparsable or not greater than zero.
pub fn parse_positive(raw: Option<&str>, fallback: u64) -> u64 {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .map(|value| value as u64)
        .unwrap_or(fallback)
}

/// Parses a ratio in `[0, 1]`, returning `fallback` for anything else.
pub fn parse_ratio(raw: Option<&str>, fallback: f64) -> f64 {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && (0.0..=1.0).contains(value))
        .unwrap_or(fallback)
}

/// Reads `key` from the environment, treating blank values as absent.
pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
