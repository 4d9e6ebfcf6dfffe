//! # Storage
//!
//! The orchestrator talks to persistence through [`HistoryStore`]. Every write
//! is conflict tolerant, so overlapping runs can duplicate work but never
//! corrupt state.
//!
//! ## Implementations:
//!
//! - **`postgres`**: `PostgresStore`, backed by the shared `deadpool-postgres`
//!   pool from `lib_common`.
//! - **`memory`**: `MemoryStore`, an in-process store for offline runs and tests.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::model::{EntityKey, MarketHistoryBucket, Source};

/// In-process store.
pub mod memory;
/// PostgreSQL store.
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Rows written by one insert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows written.
    pub inserted: usize,
    /// Rows already present (a concurrent run got there first).
    pub skipped: usize,
    /// Start of the newest inserted bucket.
    pub latest_inserted: Option<DateTime<Utc>>,
}

/// Persistence needed by one ingestion run.
pub trait HistoryStore: Send + Sync {
    /// Dates already stored for `key` with a bucket start at or after `cutoff`.
    fn existing_bucket_dates(
        &self,
        key: EntityKey,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<BTreeSet<NaiveDate>, StoreError>> + Send;

    /// Inserts buckets atomically; a row that already exists counts as skipped.
    fn insert_buckets(
        &self,
        key: EntityKey,
        buckets: &[MarketHistoryBucket],
        source: Source,
        ingested_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<InsertOutcome, StoreError>> + Send;

    /// Stored freshness horizon for `key`.
    fn read_cached_until(
        &self,
        key: EntityKey,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    /// Upserts the freshness entry; `cached_until` never moves backwards.
    fn write_cached_until(
        &self,
        key: EntityKey,
        cached_until: DateTime<Utc>,
        checked_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// One keyset page of eligible type ids greater than `after`, ascending.
    fn eligible_type_ids(
        &self,
        after: i64,
        page_size: usize,
    ) -> impl Future<Output = Result<Vec<i64>, StoreError>> + Send;
}
