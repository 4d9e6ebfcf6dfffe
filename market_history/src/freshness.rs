//! # Freshness Cache
//!
//! Persisted "do not refetch before" horizon per entity. Reads decide whether
//! a fetch is needed; writes happen after every attempt that reached a
//! decision and only ever move the horizon forward.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::StoreError;
use crate::headers::CacheHeaders;
use crate::model::EntityKey;
use crate::storage::HistoryStore;

/// Default fallback window when the upstream gives no `Expires` hint.
pub const DEFAULT_FALLBACK_MINUTES: i64 = 180;

/// # FreshnessCache
pub struct FreshnessCache<S> {
    store: Arc<S>,
    fallback_window: Duration,
}

impl<S: HistoryStore> FreshnessCache<S> {
    /// Cache over `store`; `fallback_window` applies when no hint is available.
    pub fn new(store: Arc<S>, fallback_window: Duration) -> Self {
        Self { store, fallback_window }
    }

    /// Stored horizon for `key`, if any.
    pub async fn read(&self, key: EntityKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store.read_cached_until(key).await
    }

    /// Upserts the entry; the stored horizon becomes `max(existing, cached_until)`.
    pub async fn write(
        &self,
        key: EntityKey,
        cached_until: DateTime<Utc>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug!(type_id = key.type_id, %cached_until, "freshness cache write");
        self.store.write_cached_until(key, cached_until, checked_at).await
    }

    /// Horizon to store after a fetch: the `Expires` hint when parseable,
    /// otherwise `now + fallback_window`.
    pub fn resolve_cached_until(&self, cache: &CacheHeaders, now: DateTime<Utc>) -> DateTime<Utc> {
        cache
            .expires
            .as_deref()
            .and_then(parse_http_date)
            .unwrap_or(now + self.fallback_window)
    }
}

/// A stored horizon strictly in the future means the entity is fresh.
pub fn is_fresh(cached_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    cached_until.is_some_and(|until| until > now)
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::storage::MemoryStore;

    fn cache() -> FreshnessCache<MemoryStore> {
        FreshnessCache::new(Arc::new(MemoryStore::new()), Duration::minutes(DEFAULT_FALLBACK_MINUTES))
    }

    #[test]
    fn test_expires_header_wins() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap();
        let headers = CacheHeaders {
            expires: Some("Fri, 16 Oct 2026 11:05:00 GMT".into()),
            ..CacheHeaders::default()
        };
        assert_eq!(
            cache().resolve_cached_until(&headers, now),
            Utc.with_ymd_and_hms(2026, 10, 16, 11, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_or_bad_hint_uses_fallback() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap();
        let fallback = now + Duration::minutes(180);

        assert_eq!(cache().resolve_cached_until(&CacheHeaders::default(), now), fallback);

        let garbage = CacheHeaders {
            expires: Some("soon".into()),
            ..CacheHeaders::default()
        };
        assert_eq!(cache().resolve_cached_until(&garbage, now), fallback);
    }

    #[test]
    fn test_is_fresh_requires_future_horizon() {
        let now = Utc::now();
        assert!(is_fresh(Some(now + Duration::hours(1)), now));
        assert!(!is_fresh(Some(now), now));
        assert!(!is_fresh(None, now));
    }

    #[tokio::test]
    async fn test_writes_never_regress() {
        let cache = cache();
        let key = EntityKey::new(100, 10000002);
        let base = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();

        for offset in [5, 1, 9, 3] {
            cache.write(key, base + Duration::hours(offset), Utc::now()).await.unwrap();
        }
        assert_eq!(cache.read(key).await.unwrap(), Some(base + Duration::hours(9)));
    }
}
