//! # In-Memory Store
//!
//! `HistoryStore` kept in process memory. Used for fixture dry runs and as
//! the storage double in tests; individual types can be configured to fail.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};

use super::{HistoryStore, InsertOutcome};
use crate::error::StoreError;
use crate::model::{EntityKey, MarketHistoryBucket, Source, bucket_start};

/// A stored freshness entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRow {
    /// Freshness horizon.
    pub cached_until: DateTime<Utc>,
    /// Last time the entity was considered.
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeMap<EntityKey, BTreeMap<NaiveDate, MarketHistoryBucket>>,
    cache: HashMap<EntityKey, CacheRow>,
    eligible: BTreeSet<i64>,
    failing: HashSet<i64>,
}

/// # MemoryStore
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds stored buckets, bypassing validation.
    pub fn seed_buckets(&self, key: EntityKey, buckets: impl IntoIterator<Item = MarketHistoryBucket>) {
        let mut inner = self.lock();
        let stored = inner.buckets.entry(key).or_default();
        for bucket in buckets {
            stored.insert(bucket.date, bucket);
        }
    }

    /// Seeds a freshness entry as-is.
    pub fn seed_cache(&self, key: EntityKey, cached_until: DateTime<Utc>, last_checked_at: DateTime<Utc>) {
        self.lock().cache.insert(
            key,
            CacheRow {
                cached_until,
                last_checked_at,
            },
        );
    }

    /// Seeds the eligible type list.
    pub fn seed_eligible(&self, type_ids: impl IntoIterator<Item = i64>) {
        self.lock().eligible.extend(type_ids);
    }

    /// Makes every bucket operation for `type_id` fail.
    pub fn fail_type(&self, type_id: i64) {
        self.lock().failing.insert(type_id);
    }

    /// Stored buckets for `key`, ascending by date.
    pub fn buckets(&self, key: EntityKey) -> Vec<MarketHistoryBucket> {
        self.lock()
            .buckets
            .get(&key)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored freshness entry for `key`.
    pub fn cache_row(&self, key: EntityKey) -> Option<CacheRow> {
        self.lock().cache.get(&key).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(inner: &Inner, key: EntityKey) -> Result<(), StoreError> {
        if inner.failing.contains(&key.type_id) {
            return Err(StoreError::Unavailable(format!("type {} is configured to fail", key.type_id)));
        }
        Ok(())
    }
}

impl HistoryStore for MemoryStore {
    async fn existing_bucket_dates(
        &self,
        key: EntityKey,
        cutoff: DateTime<Utc>,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner, key)?;
        Ok(inner
            .buckets
            .get(&key)
            .map(|stored| {
                stored
                    .keys()
                    .filter(|date| bucket_start(**date) >= cutoff)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_buckets(
        &self,
        key: EntityKey,
        buckets: &[MarketHistoryBucket],
        _source: Source,
        _ingested_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock();
        Self::check_available(&inner, key)?;

        let stored = inner.buckets.entry(key).or_default();
        let mut outcome = InsertOutcome::default();
        for bucket in buckets {
            if stored.contains_key(&bucket.date) {
                outcome.skipped += 1;
                continue;
            }
            stored.insert(bucket.date, bucket.clone());
            outcome.inserted += 1;
            let starts_at = bucket.starts_at();
            if outcome.latest_inserted.is_none_or(|latest| starts_at > latest) {
                outcome.latest_inserted = Some(starts_at);
            }
        }
        Ok(outcome)
    }

    async fn read_cached_until(&self, key: EntityKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().cache.get(&key).map(|row| row.cached_until))
    }

    async fn write_cached_until(
        &self,
        key: EntityKey,
        cached_until: DateTime<Utc>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .cache
            .entry(key)
            .and_modify(|row| {
                row.cached_until = row.cached_until.max(cached_until);
                row.last_checked_at = checked_at;
            })
            .or_insert(CacheRow {
                cached_until,
                last_checked_at: checked_at,
            });
        Ok(())
    }

    async fn eligible_type_ids(&self, after: i64, page_size: usize) -> Result<Vec<i64>, StoreError> {
        use std::ops::Bound::{Excluded, Unbounded};
        Ok(self
            .lock()
            .eligible
            .range((Excluded(after), Unbounded))
            .take(page_size)
            .copied()
            .collect())
    }
}
