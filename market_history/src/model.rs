//! # Domain Model
//!
//! Daily history buckets, entity keys, per-entity summary entries and the
//! aggregate run summary. Everything that ends up in a report serializes with
//! camelCase keys.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::headers::{CacheHeaders, ErrorLimitHeaders, RateLimitHeaders};
use crate::pacing::PacingTotals;

/// Identity of an ingestion unit: an item type within a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    /// Item type identifier.
    pub type_id: i64,
    /// Region identifier.
    pub region_id: i64,
}

impl EntityKey {
    /// Builds a key.
    pub fn new(type_id: i64, region_id: i64) -> Self {
        Self { type_id, region_id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={} region={}", self.type_id, self.region_id)
    }
}

/// One UTC calendar day of aggregated market statistics.
///
/// Identity is `(type, region, date)`; storage holds at most one row per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketHistoryBucket {
    /// Bucket day (`YYYY-MM-DD`).
    pub date: NaiveDate,
    /// Average traded price.
    pub average: f64,
    /// Highest traded price.
    pub highest: f64,
    /// Lowest traded price.
    pub lowest: f64,
    /// Units traded.
    pub volume: i64,
    /// Number of orders, when reported.
    #[serde(default, alias = "order_count", skip_serializing_if = "Option::is_none")]
    pub order_count: Option<i64>,
    /// Median price, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median: Option<f64>,
}

impl MarketHistoryBucket {
    /// Start of the bucket day, midnight UTC.
    pub fn starts_at(&self) -> DateTime<Utc> {
        bucket_start(self.date)
    }
}

/// Midnight UTC of `date`.
pub fn bucket_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Per-entity outcome of a run. Mutually exclusive and exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionStatus {
    /// Freshness cache hit; nothing fetched.
    CacheValid,
    /// Fetched, nothing missing.
    UpToDate,
    /// Fetched, at least one bucket inserted.
    Ingested,
    /// Missing buckets identified, insertion suppressed.
    DryRun,
    /// Fetch or reconciliation failed terminally.
    Error,
}

impl IngestionStatus {
    /// Wire name used in progress lines and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::CacheValid => "cache-valid",
            IngestionStatus::UpToDate => "up-to-date",
            IngestionStatus::Ingested => "ingested",
            IngestionStatus::DryRun => "dry-run",
            IngestionStatus::Error => "error",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity's candidate buckets came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The upstream market API.
    Esi,
    /// A local fixture map.
    Fixture,
    /// The freshness cache short-circuited the fetch.
    Cache,
}

impl Source {
    /// Wire name used in progress lines, reports and the `source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Esi => "esi",
            Source::Fixture => "fixture",
            Source::Cache => "cache",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one entity's processing in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSummaryEntry {
    /// Item type identifier.
    pub type_id: i64,
    /// Candidate source.
    pub source: Source,
    /// Candidates inside the lookback window.
    pub attempted: usize,
    /// Candidates absent from storage.
    pub missing: usize,
    /// Buckets written.
    pub inserted: usize,
    /// Missing buckets not written (dry run or concurrent insert).
    pub skipped: usize,
    /// Stored buckets found inside the window before merging.
    pub existing: usize,
    /// Latest bucket present after processing.
    pub latest: Option<DateTime<Utc>>,
    /// Freshness headers of the successful response.
    pub cache: CacheHeaders,
    /// Rate-limit headers of the successful response.
    pub rate_limit: RateLimitHeaders,
    /// Error-limit headers of the successful response.
    pub error_limit: ErrorLimitHeaders,
    /// Outcome.
    pub status: IngestionStatus,
    /// Error text or run-mode note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall time spent on this entity.
    pub duration_ms: u64,
}

impl IngestionSummaryEntry {
    /// Entry for an entity short-circuited by the freshness cache.
    pub fn cache_valid(type_id: i64) -> Self {
        Self::empty(type_id, Source::Cache, IngestionStatus::CacheValid)
    }

    /// Entry for an entity that failed terminally.
    pub fn failed(type_id: i64, source: Source, message: String, duration_ms: u64) -> Self {
        Self {
            message: Some(message),
            duration_ms,
            ..Self::empty(type_id, source, IngestionStatus::Error)
        }
    }

    fn empty(type_id: i64, source: Source, status: IngestionStatus) -> Self {
        Self {
            type_id,
            source,
            attempted: 0,
            missing: 0,
            inserted: 0,
            skipped: 0,
            existing: 0,
            latest: None,
            cache: CacheHeaders::default(),
            rate_limit: RateLimitHeaders::default(),
            error_limit: ErrorLimitHeaders::default(),
            status,
            message: None,
            duration_ms: 0,
        }
    }
}

/// Aggregate counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    /// Buckets inserted.
    pub inserted: usize,
    /// Buckets skipped.
    pub skipped: usize,
    /// Buckets missing before merge.
    pub missing: usize,
    /// Entities in error.
    pub errors: usize,
}

impl Totals {
    /// Sums the entries.
    pub fn from_entries(entries: &[IngestionSummaryEntry]) -> Self {
        entries.iter().fold(Totals::default(), |mut acc, entry| {
            acc.inserted += entry.inserted;
            acc.skipped += entry.skipped;
            acc.missing += entry.missing;
            if entry.status == IngestionStatus::Error {
                acc.errors += 1;
            }
            acc
        })
    }
}

/// Number of entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    /// `cache-valid` entries.
    pub cache_hits: usize,
    /// `ingested` entries.
    pub ingested: usize,
    /// `up-to-date` entries.
    pub up_to_date: usize,
    /// `dry-run` entries.
    pub dry_run: usize,
    /// `error` entries.
    pub errors: usize,
}

/// Result of one invocation: run parameters, timing and the ordered entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Region ingested.
    pub region_id: i64,
    /// Lookback window in days.
    pub days: i64,
    /// Whether insertion was suppressed.
    pub dry_run: bool,
    /// Number of entries.
    pub processed_types: usize,
    /// Aggregate counters.
    pub totals: Totals,
    /// Run wall time.
    pub duration_ms: u64,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub completed_at: DateTime<Utc>,
    /// Cumulative adaptive pacing delay.
    pub limiter: PacingTotals,
    /// Per-entity entries in processing order.
    pub entries: Vec<IngestionSummaryEntry>,
}

impl RunSummary {
    /// Entries with status `error`.
    pub fn failures(&self) -> Vec<IngestionSummaryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.status == IngestionStatus::Error)
            .cloned()
            .collect()
    }

    /// Per-status counts.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            match entry.status {
                IngestionStatus::CacheValid => counts.cache_hits += 1,
                IngestionStatus::Ingested => counts.ingested += 1,
                IngestionStatus::UpToDate => counts.up_to_date += 1,
                IngestionStatus::DryRun => counts.dry_run += 1,
                IngestionStatus::Error => counts.errors += 1,
            }
        }
        counts
    }
}
