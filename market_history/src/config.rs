//! # Ingestion Configuration
//!
//! Tuning knobs come from the environment and fall back to their defaults
//! when absent or invalid. Run options come from the command line and are
//! validated strictly.

use std::path::PathBuf;
use std::time::Duration;

use lib_common::configs::{env_string, parse_positive, parse_ratio};

use crate::error::ConfigError;
use crate::fetcher::RetryPolicy;
use crate::freshness::DEFAULT_FALLBACK_MINUTES;
use crate::limiter::LimiterConfig;
use crate::pacing::PacingPolicy;

/// Default upstream base URL.
pub const DEFAULT_ESI_BASE_URL: &str = "https://esi.evetech.net/latest/";
/// Default report directory.
pub const DEFAULT_REPORT_DIR: &str = "logs/ingestion";
/// Default region (The Forge).
pub const DEFAULT_REGION_ID: i64 = 10_000_002;
/// Default lookback window.
pub const DEFAULT_DAYS: i64 = 90;

/// # IngestConfig
///
/// Everything tunable without touching the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Post-fetch pacing thresholds.
    pub pacing: PacingPolicy,
    /// Fetch retry policy.
    pub retry: RetryPolicy,
    /// Limiter bounds.
    pub limiter: LimiterConfig,
    /// Freshness fallback when the upstream sends no `Expires`.
    pub refresh_window: chrono::Duration,
    /// Upstream base URL.
    pub esi_base_url: String,
    /// Directory for run artifacts.
    pub report_dir: PathBuf,
    /// Storage connection string.
    pub database_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl IngestConfig {
    /// Reads every knob from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(env_string)
    }

    /// Reads every knob through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let positive = |key: &str, fallback: u64| parse_positive(lookup(key).as_deref(), fallback);
        let millis = |key: &str, fallback: u64| Duration::from_millis(positive(key, fallback));

        let initial = positive("MARKET_INGEST_CONCURRENCY", 6) as usize;
        let max = positive("MARKET_INGEST_MAX_CONCURRENCY", initial.max(8) as u64) as usize;

        Self {
            pacing: PacingPolicy {
                rate_threshold: positive("MARKET_INGEST_RATE_THRESHOLD", 25) as i64,
                rate_sleep: millis("MARKET_INGEST_RATE_SLEEP_MS", 2_000),
                error_threshold: positive("MARKET_INGEST_ERROR_THRESHOLD", 10) as i64,
                error_sleep: millis("MARKET_INGEST_ERROR_SLEEP_MS", 5_000),
            },
            retry: RetryPolicy {
                max_attempts: positive("MARKET_INGEST_MAX_ATTEMPTS", 5).min(u64::from(u32::MAX)) as u32,
                base_delay: millis("MARKET_INGEST_RETRY_BASE_MS", 3_000),
                jitter_ratio: parse_ratio(lookup("MARKET_INGEST_RETRY_JITTER_RATIO").as_deref(), 0.2),
            },
            limiter: LimiterConfig { initial, min: 1, max }.normalized(),
            refresh_window: chrono::Duration::minutes(
                positive("MARKET_HISTORY_REFRESH_WINDOW_MINUTES", DEFAULT_FALLBACK_MINUTES as u64) as i64,
            ),
            esi_base_url: lookup("MARKET_INGEST_ESI_BASE_URL").unwrap_or_else(|| DEFAULT_ESI_BASE_URL.to_string()),
            report_dir: lookup("MARKET_INGEST_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR)),
            database_url: lookup("DATABASE_URL"),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Region to ingest.
    pub region_id: i64,
    /// Lookback window in days.
    pub days: i64,
    /// Identify missing buckets without writing them.
    pub dry_run: bool,
    /// Fetch even when the freshness cache says the entity is fresh.
    pub ignore_cache: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            region_id: DEFAULT_REGION_ID,
            days: DEFAULT_DAYS,
            dry_run: false,
            ignore_cache: false,
        }
    }
}

impl RunOptions {
    /// Validated options; region and days must be positive.
    pub fn new(region_id: i64, days: i64, dry_run: bool, ignore_cache: bool) -> Result<Self, ConfigError> {
        if region_id <= 0 {
            return Err(ConfigError::NotPositive {
                name: "region",
                value: region_id,
            });
        }
        if days <= 0 {
            return Err(ConfigError::NotPositive { name: "days", value: days });
        }
        Ok(Self {
            region_id,
            days,
            dry_run,
            ignore_cache,
        })
    }
}
