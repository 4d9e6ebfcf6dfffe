//! # Ingestion Orchestrator
//!
//! Drives a run over an ordered list of type ids.
//!
//! Per entity:
//! 1. Read the freshness cache (unless bypassed); a future horizon short-circuits to `cache-valid`.
//! 2. Obtain candidates from the fixture map, or from the upstream inside the limiter.
//! 3. Diff against stored dates in the lookback window and merge what is missing.
//! 4. Classify the status and refresh the freshness cache.
//! 5. After a real upstream fetch, pace on the reported rate and error budgets.
//! 6. Append the summary entry and emit a progress line.
//!
//! Any failure in steps 1-5 becomes an `error` entry and the run moves on.
//!
//! Upstream fetches are spawned ahead of time into a look-ahead window as wide
//! as the limiter's maximum concurrency, so the limiter can keep several
//! requests in flight. Their results are still consumed strictly in entity
//! order, and everything after the fetch runs sequentially on this task.
//! The fetcher shares the pacing policy, so a low budget reported by one
//! response also pauses the fetches already spawned behind it.
//!
//! An entry's `duration_ms` covers that entity's own work: its fetch phase
//! and its sequential phase up to the freshness write. Time spent queued
//! behind other entities, or waiting out their pacing, is not included.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{IngestConfig, RunOptions};
use crate::entity_source::FixtureMap;
use crate::error::{FetchError, IngestError};
use crate::fetcher::{FetchOutcome, HistoryTransport, RetryingFetcher};
use crate::freshness::{FreshnessCache, is_fresh};
use crate::model::{EntityKey, IngestionSummaryEntry, MarketHistoryBucket, RunSummary, Source, Totals};
use crate::pacing::{PacingPolicy, PacingTotals};
use crate::progress::{ProgressContext, ProgressWriter};
use crate::reconciler::{BucketReconciler, plan};
use crate::reporter::RunReporter;
use crate::storage::HistoryStore;

/// Message attached to entries of a dry run.
pub const DRY_RUN_MESSAGE: &str = "dry run";

/// What is known about an entity once its fetch phase has been started.
enum Work {
    /// Freshness horizon still in the future.
    Fresh { cached_until: DateTime<Utc> },
    /// Candidates from the fixture map.
    Fixture(Vec<MarketHistoryBucket>),
    /// Upstream fetch running inside the limiter, with the time it took.
    Remote(JoinHandle<(Duration, Result<FetchOutcome, FetchError>)>),
    /// The fetch phase itself failed.
    Failed(IngestError),
}

struct Pending {
    key: EntityKey,
    source: Source,
    /// Time spent in `start`.
    prepared_in: Duration,
    work: Work,
}

/// Time charged to one entity.
#[derive(Clone, Copy)]
struct EntityClock {
    fetched_in: Duration,
    processing: Instant,
}

impl EntityClock {
    /// Starts the sequential phase after `fetched_in` of fetch-phase work.
    fn start(fetched_in: Duration) -> Self {
        Self {
            fetched_in,
            processing: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        (self.fetched_in + self.processing.elapsed()).as_millis() as u64
    }
}

/// # IngestionOrchestrator
///
/// Owns the per-run collaborators. The store is shared with the freshness
/// cache and the reconciler; the fetcher is shared with spawned fetch tasks.
pub struct IngestionOrchestrator<S, T> {
    fetcher: Arc<RetryingFetcher<T>>,
    freshness: FreshnessCache<S>,
    reconciler: BucketReconciler<S>,
    pacing: PacingPolicy,
    fixtures: Option<FixtureMap>,
    reporter: Option<RunReporter>,
    progress: bool,
}

impl<S: HistoryStore, T: HistoryTransport> IngestionOrchestrator<S, T> {
    /// Builds an orchestrator over `store` and `fetcher`, tuned by `config`.
    pub fn new(store: Arc<S>, fetcher: RetryingFetcher<T>, config: &IngestConfig) -> Self {
        Self {
            fetcher: Arc::new(fetcher.with_pacing(config.pacing)),
            freshness: FreshnessCache::new(Arc::clone(&store), config.refresh_window),
            reconciler: BucketReconciler::new(store),
            pacing: config.pacing,
            fixtures: None,
            reporter: None,
            progress: true,
        }
    }

    /// Serves candidates for the listed types from `fixtures` instead of the upstream.
    pub fn with_fixtures(mut self, fixtures: FixtureMap) -> Self {
        self.fixtures = Some(fixtures);
        self
    }

    /// Persists run artifacts through `reporter` at the end of every run.
    pub fn with_reporter(mut self, reporter: RunReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Enables or disables the progress stream on stdout.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Processes every type id in order and returns the run summary.
    ///
    /// Per-entity failures are recorded in the summary; this never fails.
    pub async fn run(&self, type_ids: &[i64], options: &RunOptions) -> RunSummary {
        let started_at = Utc::now();
        let started = Instant::now();
        let cutoff = started_at - chrono::Duration::days(options.days);
        let total = type_ids.len();
        let lookahead = self.fetcher.limiter().max_concurrency().max(1);

        info!(
            region_id = options.region_id,
            days = options.days,
            dry_run = options.dry_run,
            ignore_cache = options.ignore_cache,
            types = total,
            "market history ingestion started"
        );

        let mut progress = self.progress.then(ProgressWriter::default);
        let mut pacing_totals = PacingTotals::default();
        let mut entries = Vec::with_capacity(total);
        let mut queue: VecDeque<Pending> = VecDeque::with_capacity(lookahead);
        let mut upcoming = type_ids.iter().copied();

        loop {
            while queue.len() < lookahead {
                let Some(type_id) = upcoming.next() else {
                    break;
                };
                let key = EntityKey::new(type_id, options.region_id);
                queue.push_back(self.start(key, options).await);
            }

            let Some(pending) = queue.pop_front() else {
                break;
            };

            let entry = self.finish(pending, options, cutoff, &mut pacing_totals).await;

            let processed = entries.len() + 1;
            if let Some(writer) = progress.as_mut() {
                let eta = estimate_eta(started.elapsed(), processed, total);
                writer.write(&ProgressContext {
                    processed,
                    total,
                    eta,
                    type_id: entry.type_id,
                    source: entry.source,
                    attempted: entry.attempted,
                    missing: entry.missing,
                    inserted: entry.inserted,
                    skipped: entry.skipped,
                    status: entry.status,
                    rate_limit: &entry.rate_limit,
                    error_limit: &entry.error_limit,
                    cache: &entry.cache,
                });
            }
            entries.push(entry);
        }

        let completed_at = Utc::now();
        let summary = RunSummary {
            region_id: options.region_id,
            days: options.days,
            dry_run: options.dry_run,
            processed_types: entries.len(),
            totals: Totals::from_entries(&entries),
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at,
            limiter: pacing_totals,
            entries,
        };

        info!(
            processed = summary.processed_types,
            inserted = summary.totals.inserted,
            skipped = summary.totals.skipped,
            missing = summary.totals.missing,
            errors = summary.totals.errors,
            duration_ms = summary.duration_ms,
            "market history ingestion finished"
        );

        if let Some(reporter) = &self.reporter {
            reporter.persist_run(&summary).await;
        }
        summary
    }

    /// Fetch phase: freshness check, then fixture lookup or a spawned upstream fetch.
    async fn start(&self, key: EntityKey, options: &RunOptions) -> Pending {
        let started = Instant::now();
        let fixture = self.fixtures.as_ref().and_then(|map| map.get(&key.type_id));
        let source = if fixture.is_some() { Source::Fixture } else { Source::Esi };
        let pending = |work| Pending {
            key,
            source,
            prepared_in: started.elapsed(),
            work,
        };

        if !options.ignore_cache {
            match self.freshness.read(key).await {
                Ok(cached) if is_fresh(cached, Utc::now()) => {
                    if let Some(cached_until) = cached {
                        return pending(Work::Fresh { cached_until });
                    }
                }
                Ok(_) => {}
                Err(e) => return pending(Work::Failed(e.into())),
            }
        }

        if let Some(buckets) = fixture {
            return pending(Work::Fixture(buckets.clone()));
        }

        let fetcher = Arc::clone(&self.fetcher);
        pending(Work::Remote(tokio::spawn(async move { fetcher.fetch_timed(key).await })))
    }

    /// Sequential phase: reconcile, refresh the cache, pace, build the entry.
    async fn finish(
        &self,
        pending: Pending,
        options: &RunOptions,
        cutoff: DateTime<Utc>,
        pacing_totals: &mut PacingTotals,
    ) -> IngestionSummaryEntry {
        let Pending {
            key,
            source,
            prepared_in,
            work,
        } = pending;
        let mut clock = EntityClock::start(prepared_in);

        let result = match work {
            Work::Fresh { cached_until } => self
                .freshness
                .write(key, cached_until, Utc::now())
                .await
                .map(|()| IngestionSummaryEntry::cache_valid(key.type_id))
                .map_err(IngestError::from),
            Work::Fixture(buckets) => {
                let outcome = FetchOutcome {
                    buckets,
                    cache: Default::default(),
                    rate_limit: Default::default(),
                    error_limit: Default::default(),
                    attempts: 0,
                };
                self.ingest(key, Source::Fixture, outcome, options, cutoff, clock, pacing_totals)
                    .await
            }
            Work::Remote(handle) => {
                let joined = handle.await;
                let fetched_in = joined.as_ref().map_or(Duration::ZERO, |(took, _)| *took);
                clock = EntityClock::start(prepared_in + fetched_in);
                match joined {
                    Ok((_, Ok(outcome))) => {
                        self.ingest(key, Source::Esi, outcome, options, cutoff, clock, pacing_totals)
                            .await
                    }
                    Ok((_, Err(e))) => Err(e.into()),
                    Err(join) => Err(IngestError::TaskFailed {
                        type_id: key.type_id,
                        message: join.to_string(),
                    }),
                }
            }
            Work::Failed(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            warn!(type_id = key.type_id, region_id = key.region_id, error = %e, "failed to ingest type");
            IngestionSummaryEntry::failed(key.type_id, source, e.to_string(), clock.elapsed_ms())
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest(
        &self,
        key: EntityKey,
        source: Source,
        outcome: FetchOutcome,
        options: &RunOptions,
        cutoff: DateTime<Utc>,
        clock: EntityClock,
        pacing_totals: &mut PacingTotals,
    ) -> Result<IngestionSummaryEntry, IngestError> {
        let FetchOutcome {
            buckets,
            cache,
            rate_limit,
            error_limit,
            ..
        } = outcome;

        let existing = self.reconciler.existing_dates(key, cutoff).await?;
        let plan = plan(buckets, &existing, cutoff);
        let merged = self
            .reconciler
            .apply(key, &plan, source, options.dry_run, Utc::now())
            .await?;
        let status = merged.status(options.dry_run);

        let checked_at = Utc::now();
        let cached_until = self.freshness.resolve_cached_until(&cache, checked_at);
        self.freshness.write(key, cached_until, checked_at).await?;
        let duration_ms = clock.elapsed_ms();

        if source == Source::Esi {
            self.pacing
                .pace(key.type_id, &rate_limit, &error_limit, pacing_totals)
                .await;
        }

        Ok(IngestionSummaryEntry {
            type_id: key.type_id,
            source,
            attempted: merged.attempted,
            missing: merged.missing,
            inserted: merged.inserted,
            skipped: merged.skipped,
            existing: merged.existing,
            latest: merged.latest,
            cache,
            rate_limit,
            error_limit,
            status,
            message: options.dry_run.then(|| DRY_RUN_MESSAGE.to_string()),
            duration_ms,
        })
    }
}

/// Average time per processed entity times the entities left.
pub fn estimate_eta(elapsed: Duration, processed: usize, total: usize) -> Duration {
    let remaining = total.saturating_sub(processed);
    if processed == 0 || remaining == 0 {
        return Duration::ZERO;
    }
    elapsed.div_f64(processed as f64).mul_f64(remaining as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eta_uses_running_average() {
        assert_eq!(estimate_eta(Duration::from_secs(10), 2, 6), Duration::from_secs(20));
        assert_eq!(estimate_eta(Duration::from_secs(10), 6, 6), Duration::ZERO);
        assert_eq!(estimate_eta(Duration::from_secs(10), 0, 6), Duration::ZERO);
    }
}
