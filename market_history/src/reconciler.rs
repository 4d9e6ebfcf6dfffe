//! # Bucket Reconciler
//!
//! Diffs candidate buckets against the dates already stored inside the
//! lookback window and inserts only what is missing. Inserts are conflict
//! tolerant: a row written by an overlapping run in the meantime is counted
//! as skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ReconcileError;
use crate::model::{EntityKey, IngestionStatus, MarketHistoryBucket, Source, bucket_start};
use crate::storage::HistoryStore;

/// Result of diffing candidates against stored dates. Pure, no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    /// Candidates inside the window, ascending, one per date.
    pub in_window: Vec<MarketHistoryBucket>,
    /// Subset of `in_window` absent from storage.
    pub missing: Vec<MarketHistoryBucket>,
    /// Stored dates inside the window.
    pub existing: usize,
    /// Newest stored date inside the window.
    pub latest_existing: Option<NaiveDate>,
}

/// Counters of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Candidates inside the window.
    pub attempted: usize,
    /// Candidates absent from storage.
    pub missing: usize,
    /// Buckets written.
    pub inserted: usize,
    /// Missing buckets not written.
    pub skipped: usize,
    /// Stored buckets inside the window before merging.
    pub existing: usize,
    /// Newest bucket present afterwards, new or pre-existing.
    pub latest: Option<DateTime<Utc>>,
}

impl ReconcileOutcome {
    /// Status of a fetched entity. A dry run with something missing is `dry-run`.
    pub fn status(&self, dry_run: bool) -> IngestionStatus {
        if dry_run && self.missing > 0 {
            IngestionStatus::DryRun
        } else if self.inserted > 0 {
            IngestionStatus::Ingested
        } else {
            IngestionStatus::UpToDate
        }
    }
}

/// Filters to `starts_at >= cutoff`, sorts, keeps the first bucket per date
/// and diffs against `existing`.
pub fn plan(
    candidates: Vec<MarketHistoryBucket>,
    existing: &BTreeSet<NaiveDate>,
    cutoff: DateTime<Utc>,
) -> ReconcilePlan {
    let mut in_window: Vec<MarketHistoryBucket> = candidates
        .into_iter()
        .filter(|bucket| bucket.starts_at() >= cutoff)
        .collect();
    in_window.sort_by_key(|bucket| bucket.date);
    in_window.dedup_by_key(|bucket| bucket.date);

    let missing = in_window
        .iter()
        .filter(|bucket| !existing.contains(&bucket.date))
        .cloned()
        .collect();

    ReconcilePlan {
        in_window,
        missing,
        existing: existing.len(),
        latest_existing: existing.iter().next_back().copied(),
    }
}

/// Checks that every numeric field is finite and non-negative and that
/// `highest >= lowest`.
pub fn validate_bucket(type_id: i64, bucket: &MarketHistoryBucket) -> Result<(), ReconcileError> {
    let invalid = |reason: String| ReconcileError::InvalidBucket {
        type_id,
        date: bucket.date,
        reason,
    };

    let prices = [
        ("average", Some(bucket.average)),
        ("highest", Some(bucket.highest)),
        ("lowest", Some(bucket.lowest)),
        ("median", bucket.median),
    ];
    for (name, value) in prices {
        if let Some(value) = value {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{} price {} is not a finite non-negative number", name, value)));
            }
        }
    }
    if bucket.volume < 0 {
        return Err(invalid(format!("volume {} is negative", bucket.volume)));
    }
    if let Some(count) = bucket.order_count.filter(|c| *c < 0) {
        return Err(invalid(format!("order count {} is negative", count)));
    }
    if bucket.highest < bucket.lowest {
        return Err(invalid(format!("highest {} is below lowest {}", bucket.highest, bucket.lowest)));
    }
    Ok(())
}

/// # BucketReconciler
pub struct BucketReconciler<S> {
    store: Arc<S>,
}

impl<S: HistoryStore> BucketReconciler<S> {
    /// Reconciler writing into `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Stored dates of `key` inside the window.
    pub async fn existing_dates(
        &self,
        key: EntityKey,
        cutoff: DateTime<Utc>,
    ) -> Result<BTreeSet<NaiveDate>, ReconcileError> {
        Ok(self.store.existing_bucket_dates(key, cutoff).await?)
    }

    /// Writes the plan's missing buckets. With `dry_run` nothing is written and
    /// every missing bucket counts as skipped.
    pub async fn apply(
        &self,
        key: EntityKey,
        plan: &ReconcilePlan,
        source: Source,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for bucket in &plan.missing {
            validate_bucket(key.type_id, bucket)?;
        }

        let mut outcome = ReconcileOutcome {
            attempted: plan.in_window.len(),
            missing: plan.missing.len(),
            existing: plan.existing,
            latest: plan.latest_existing.map(bucket_start),
            ..ReconcileOutcome::default()
        };

        if plan.missing.is_empty() {
            return Ok(outcome);
        }

        let newest_missing = plan.missing.last().map(MarketHistoryBucket::starts_at);
        if dry_run {
            outcome.skipped = plan.missing.len();
            outcome.latest = outcome.latest.max(newest_missing);
            return Ok(outcome);
        }

        let written = self.store.insert_buckets(key, &plan.missing, source, now).await?;
        outcome.inserted = written.inserted;
        outcome.skipped = written.skipped;
        // Skipped rows exist now too, so the newest missing date is present either way.
        outcome.latest = outcome.latest.max(newest_missing);
        Ok(outcome)
    }

    /// `existing_dates`, `plan` and `apply` in one call.
    pub async fn reconcile(
        &self,
        key: EntityKey,
        candidates: Vec<MarketHistoryBucket>,
        cutoff: DateTime<Utc>,
        source: Source,
        dry_run: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let existing = self.existing_dates(key, cutoff).await?;
        let plan = plan(candidates, &existing, cutoff);
        self.apply(key, &plan, source, dry_run, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::storage::MemoryStore;

    fn bucket(date: &str, lowest: f64, highest: f64) -> MarketHistoryBucket {
        MarketHistoryBucket {
            date: date.parse().unwrap(),
            average: (lowest + highest) / 2.0,
            highest,
            lowest,
            volume: 10,
            order_count: None,
            median: None,
        }
    }

    fn dates(raw: &[&str]) -> BTreeSet<NaiveDate> {
        raw.iter().map(|d| d.parse().unwrap()).collect()
    }

    #[test]
    fn test_plan_filters_sorts_and_diffs() {
        let cutoff = Utc.with_ymd_and_hms(2026, 10, 10, 9, 30, 0).unwrap();
        let candidates = vec![
            bucket("2026-10-13", 1.0, 2.0),
            bucket("2026-10-10", 1.0, 2.0),
            bucket("2026-10-11", 1.0, 2.0),
            bucket("2026-10-12", 1.0, 2.0),
            bucket("2026-10-11", 9.0, 9.5),
        ];

        let plan = plan(candidates, &dates(&["2026-10-12"]), cutoff);

        let window: Vec<String> = plan.in_window.iter().map(|b| b.date.to_string()).collect();
        assert_eq!(window, ["2026-10-11", "2026-10-12", "2026-10-13"]);
        let missing: Vec<String> = plan.missing.iter().map(|b| b.date.to_string()).collect();
        assert_eq!(missing, ["2026-10-11", "2026-10-13"]);
        assert_eq!(plan.in_window[0].lowest, 1.0);
        assert_eq!(plan.latest_existing, Some("2026-10-12".parse().unwrap()));
    }

    #[test]
    fn test_validation_rejects_bad_buckets() {
        assert!(validate_bucket(1, &bucket("2026-10-01", 1.0, 2.0)).is_ok());
        assert!(validate_bucket(1, &bucket("2026-10-01", 3.0, 2.0)).is_err());
        assert!(validate_bucket(1, &bucket("2026-10-01", -1.0, 2.0)).is_err());

        let mut nan = bucket("2026-10-01", 1.0, 2.0);
        nan.median = Some(f64::NAN);
        assert!(validate_bucket(1, &nan).is_err());

        let mut negative_volume = bucket("2026-10-01", 1.0, 2.0);
        negative_volume.volume = -5;
        let err = validate_bucket(7, &negative_volume).unwrap_err();
        assert!(err.to_string().contains("type 7 on 2026-10-01"));
    }

    #[test]
    fn test_status_classification() {
        let outcome = ReconcileOutcome {
            missing: 2,
            inserted: 2,
            ..ReconcileOutcome::default()
        };
        assert_eq!(outcome.status(false), IngestionStatus::Ingested);
        assert_eq!(outcome.status(true), IngestionStatus::DryRun);
        assert_eq!(ReconcileOutcome::default().status(true), IngestionStatus::UpToDate);
        assert_eq!(ReconcileOutcome::default().status(false), IngestionStatus::UpToDate);
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = BucketReconciler::new(Arc::clone(&store));
        let key = EntityKey::new(34, 10000002);
        let cutoff = Utc::now() - Duration::days(30);
        let today = Utc::now().date_naive();
        let candidates: Vec<_> = (1..=4)
            .map(|back| bucket(&(today - Duration::days(back)).to_string(), 4.0, 5.0))
            .collect();

        let first = reconciler
            .reconcile(key, candidates.clone(), cutoff, Source::Esi, false)
            .await
            .unwrap();
        assert_eq!((first.inserted, first.missing), (4, 4));
        assert_eq!(first.latest, Some(bucket_start(today - Duration::days(1))));

        let second = reconciler.reconcile(key, candidates, cutoff, Source::Esi, false).await.unwrap();
        assert_eq!((second.inserted, second.missing, second.existing), (0, 0, 4));
        assert_eq!(second.status(false), IngestionStatus::UpToDate);
        assert_eq!(second.latest, first.latest);
        assert_eq!(store.buckets(key).len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_bucket_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = BucketReconciler::new(Arc::clone(&store));
        let key = EntityKey::new(35, 10000002);
        let today = Utc::now().date_naive();
        let candidates = vec![
            bucket(&(today - Duration::days(2)).to_string(), 1.0, 2.0),
            bucket(&(today - Duration::days(1)).to_string(), 5.0, 2.0),
        ];

        let result = reconciler
            .reconcile(key, candidates, Utc::now() - Duration::days(7), Source::Esi, false)
            .await;
        assert!(matches!(result, Err(ReconcileError::InvalidBucket { type_id: 35, .. })));
        assert!(store.buckets(key).is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_counts_missing_as_skipped() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = BucketReconciler::new(Arc::clone(&store));
        let key = EntityKey::new(200, 10000002);
        let today = Utc::now().date_naive();
        let candidates: Vec<_> = (1..=3)
            .map(|back| bucket(&(today - Duration::days(back)).to_string(), 1.0, 2.0))
            .collect();

        let outcome = reconciler
            .reconcile(key, candidates, Utc::now() - Duration::days(7), Source::Fixture, true)
            .await
            .unwrap();
        assert_eq!((outcome.inserted, outcome.skipped, outcome.missing), (0, 3, 3));
        assert_eq!(outcome.status(true), IngestionStatus::DryRun);
        assert!(store.buckets(key).is_empty());
    }
}
