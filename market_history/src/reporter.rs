//! # Run Reporter
//!
//! Persists the run artifacts under the report directory:
//! - `latest-failures.json`: error entries of the last run, rewritten every run.
//! - `archive/failures-<timestamp>.json`: a copy, only when there were failures.
//! - `history-metrics.json`: totals, per-status counts and pacing delay.
//!
//! Files are written to a temporary sibling and renamed into place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ReportError;
use crate::model::{IngestionSummaryEntry, RunSummary, Totals};
use crate::pacing::PacingTotals;

/// Latest failure report file name.
pub const LATEST_FAILURES_FILE: &str = "latest-failures.json";
/// Metrics file name.
pub const METRICS_FILE: &str = "history-metrics.json";
/// Failure archive subdirectory.
pub const ARCHIVE_DIR: &str = "archive";

/// Run parameters stamped on every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportContext {
    /// Region ingested.
    pub region_id: i64,
    /// Lookback window.
    pub days: i64,
    /// Whether insertion was suppressed.
    pub dry_run: bool,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub completed_at: DateTime<Utc>,
}

impl From<&RunSummary> for ReportContext {
    fn from(summary: &RunSummary) -> Self {
        Self {
            region_id: summary.region_id,
            days: summary.days,
            dry_run: summary.dry_run,
            started_at: summary.started_at,
            completed_at: summary.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailurePayload<'a> {
    generated_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    region_id: i64,
    days: i64,
    dry_run: bool,
    error_count: usize,
    entries: &'a [IngestionSummaryEntry],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsPayload {
    generated_at: DateTime<Utc>,
    region_id: i64,
    totals: Totals,
    duration_ms: u64,
    cache_hits: usize,
    ingested: usize,
    up_to_date: usize,
    dry_run: usize,
    errors: usize,
    limiter: PacingTotals,
}

/// # RunReporter
#[derive(Debug, Clone)]
pub struct RunReporter {
    dir: PathBuf,
}

impl RunReporter {
    /// Reporter writing under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Report directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrites the latest failure report and archives a copy when `entries` is non-empty.
    ///
    /// Returns the archive path when one was written.
    pub async fn persist_failures(
        &self,
        entries: &[IngestionSummaryEntry],
        context: &ReportContext,
    ) -> Result<Option<PathBuf>, ReportError> {
        let payload = FailurePayload {
            generated_at: context.completed_at,
            started_at: context.started_at,
            region_id: context.region_id,
            days: context.days,
            dry_run: context.dry_run,
            error_count: entries.len(),
            entries,
        };
        let body = to_pretty_json(&payload)?;

        write_atomic(&self.dir.join(LATEST_FAILURES_FILE), &body).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let archive = self
            .dir
            .join(ARCHIVE_DIR)
            .join(format!("failures-{}.json", archive_stamp(context.completed_at)));
        write_atomic(&archive, &body).await?;
        Ok(Some(archive))
    }

    /// Rewrites the metrics artifact.
    pub async fn persist_metrics(&self, summary: &RunSummary) -> Result<PathBuf, ReportError> {
        let counts = summary.status_counts();
        let payload = MetricsPayload {
            generated_at: Utc::now(),
            region_id: summary.region_id,
            totals: summary.totals,
            duration_ms: summary.duration_ms,
            cache_hits: counts.cache_hits,
            ingested: counts.ingested,
            up_to_date: counts.up_to_date,
            dry_run: counts.dry_run,
            errors: counts.errors,
            limiter: summary.limiter,
        };

        let path = self.dir.join(METRICS_FILE);
        write_atomic(&path, &to_pretty_json(&payload)?).await?;
        Ok(path)
    }

    /// Writes both artifacts. Failures are logged, never returned.
    pub async fn persist_run(&self, summary: &RunSummary) {
        let context = ReportContext::from(summary);

        match self.persist_failures(&summary.failures(), &context).await {
            Ok(Some(archive)) => info!(archive = %archive.display(), "failure report archived"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to persist failure report"),
        }
        if let Err(e) = self.persist_metrics(summary).await {
            warn!(error = %e, "failed to persist ingestion metrics");
        }
    }
}

/// ISO timestamp with `:` and `.` replaced by `-`.
fn archive_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true).replace([':', '.'], "-")
}

fn to_pretty_json<T: Serialize>(payload: &T) -> Result<String, ReportError> {
    let mut body = serde_json::to_string_pretty(payload)?;
    body.push('\n');
    Ok(body)
}

async fn write_atomic(path: &Path, body: &str) -> Result<(), ReportError> {
    let io_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{IngestionStatus, Source};

    fn summary(entries: Vec<IngestionSummaryEntry>) -> RunSummary {
        let started_at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();
        RunSummary {
            region_id: 10000002,
            days: 90,
            dry_run: false,
            processed_types: entries.len(),
            totals: Totals::from_entries(&entries),
            duration_ms: 1_500,
            started_at,
            completed_at: started_at + chrono::Duration::milliseconds(1_500),
            limiter: PacingTotals {
                rate_delay_ms: 2_000,
                error_delay_ms: 0,
            },
            entries,
        }
    }

    #[test]
    fn test_archive_stamp_is_filename_safe() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 1).unwrap();
        assert_eq!(archive_stamp(at), "2026-10-16T09-00-01-000Z");
    }

    #[tokio::test]
    async fn test_failures_are_archived_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = RunReporter::new(dir.path().join("ingestion"));

        let clean = summary(vec![IngestionSummaryEntry::cache_valid(34)]);
        let archived = reporter
            .persist_failures(&clean.failures(), &ReportContext::from(&clean))
            .await
            .unwrap();
        assert!(archived.is_none());

        let latest = std::fs::read_to_string(reporter.dir().join(LATEST_FAILURES_FILE)).unwrap();
        assert!(latest.ends_with("}\n"));
        let latest: serde_json::Value = serde_json::from_str(&latest).unwrap();
        assert_eq!(latest["errorCount"], 0);
        assert_eq!(latest["regionId"], 10000002);

        let failing = summary(vec![
            IngestionSummaryEntry::cache_valid(34),
            IngestionSummaryEntry::failed(35, Source::Esi, "ESI request failed for type 35: 404 Not Found".into(), 80),
        ]);
        let archived = reporter
            .persist_failures(&failing.failures(), &ReportContext::from(&failing))
            .await
            .unwrap()
            .unwrap();
        assert!(archived.starts_with(reporter.dir().join(ARCHIVE_DIR)));

        let copy: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&archived).unwrap()).unwrap();
        assert_eq!(copy["errorCount"], 1);
        assert_eq!(copy["entries"][0]["typeId"], 35);
        assert_eq!(copy["entries"][0]["status"], "error");
    }

    #[tokio::test]
    async fn test_metrics_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = RunReporter::new(dir.path());

        let mut ingested = IngestionSummaryEntry::cache_valid(36);
        ingested.status = IngestionStatus::Ingested;
        ingested.source = Source::Esi;
        ingested.inserted = 4;
        let run = summary(vec![IngestionSummaryEntry::cache_valid(34), ingested]);

        reporter.persist_run(&run).await;

        let metrics: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap()).unwrap();
        assert_eq!(metrics["cacheHits"], 1);
        assert_eq!(metrics["ingested"], 1);
        assert_eq!(metrics["upToDate"], 0);
        assert_eq!(metrics["totals"]["inserted"], 4);
        assert_eq!(metrics["limiter"]["rateDelayMs"], 2_000);
        assert!(dir.path().join(LATEST_FAILURES_FILE).exists());
        assert!(!dir.path().join(ARCHIVE_DIR).exists());
    }
}
