//! # Retrying History Fetcher
//!
//! Fetches one entity's daily history from the upstream market API with a
//! bounded number of attempts. Every attempt runs while holding a single
//! limiter slot, including the sleeps between attempts.
//!
//! Classification per response:
//! - `429`: wait `Retry-After` seconds (or `attempt * 2` seconds) and retry.
//! - `5xx` with attempts left: wait `backoff(attempt)` and retry.
//! - Any other non-2xx, or `5xx` on the last attempt: terminal, body kept verbatim.
//! - `2xx`: decode the bucket array and snapshot the headers.
//!
//! Transport failures (no status at all) are retried like `5xx`.
//!
//! Every attempt first waits out any pause set on the shared limiter. With a
//! pacing policy attached, a response reporting a low rate or error budget
//! sets that pause, so fetches already queued behind it stay quiet too.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use lib_common::retrieve::{ApiClient, RawResponse};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FetchError, TransportError};
use crate::headers::{
    cache_headers, error_limit_headers, rate_limit_headers, retry_after, CacheHeaders, ErrorLimitHeaders,
    RateLimitHeaders,
};
use crate::limiter::RateAdaptiveLimiter;
use crate::model::{EntityKey, MarketHistoryBucket};
use crate::pacing::PacingPolicy;

/// Anything that can issue the raw history request for one entity.
pub trait HistoryTransport: Send + Sync + 'static {
    /// Performs one request. Non-2xx responses are returned, not raised.
    fn get_history(&self, key: EntityKey) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// # EsiTransport
///
/// `GET {base}/markets/{region}/history/?type_id={type}` through the shared `ApiClient`.
#[derive(Clone)]
pub struct EsiTransport {
    client: ApiClient,
}

impl EsiTransport {
    /// Wraps a configured client.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

impl HistoryTransport for EsiTransport {
    async fn get_history(&self, key: EntityKey) -> Result<RawResponse, TransportError> {
        let path = format!("markets/{}/history/", key.region_id);
        let query = [("type_id", key.type_id.to_string())];
        Ok(self.client.get_raw(&path, &query, None).await?)
    }
}

/// Attempt cap and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per entity, at least 1.
    pub max_attempts: u32,
    /// Backoff unit, multiplied by the attempt number.
    pub base_delay: Duration,
    /// Symmetric jitter ratio in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(3_000),
            jitter_ratio: 0.2,
        }
    }
}

/// `base_delay * attempt * (1 ± jitter_ratio)`, rounded to whole milliseconds.
pub fn backoff_delay<R: Rng + ?Sized>(policy: &RetryPolicy, attempt: u32, rng: &mut R) -> Duration {
    let base = policy.base_delay.as_millis() as f64 * f64::from(attempt.max(1));
    if !base.is_finite() || base <= 0.0 {
        return Duration::ZERO;
    }

    let ratio = policy.jitter_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 {
        return Duration::from_millis(base.round() as u64);
    }

    let jitter = base * ratio;
    let low = (base - jitter).max(0.0);
    let high = base + jitter;
    Duration::from_millis(rng.random_range(low..=high).round() as u64)
}

/// A successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Buckets as returned by the upstream, unfiltered.
    pub buckets: Vec<MarketHistoryBucket>,
    /// Freshness hints.
    pub cache: CacheHeaders,
    /// Rate-limit snapshot.
    pub rate_limit: RateLimitHeaders,
    /// Error-budget snapshot.
    pub error_limit: ErrorLimitHeaders,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// # RetryingFetcher
///
/// Owns the transport and shares the limiter with every other fetch of the run.
pub struct RetryingFetcher<T> {
    transport: T,
    limiter: Arc<RateAdaptiveLimiter>,
    policy: RetryPolicy,
    pacing: Option<PacingPolicy>,
}

impl<T: HistoryTransport> RetryingFetcher<T> {
    /// Builds a fetcher.
    pub fn new(transport: T, limiter: Arc<RateAdaptiveLimiter>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
            pacing: None,
        }
    }

    /// Pauses the shared limiter whenever a response reports a budget low enough for `pacing`.
    pub fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// The limiter gating this fetcher.
    pub fn limiter(&self) -> &Arc<RateAdaptiveLimiter> {
        &self.limiter
    }

    /// Fetches `key` inside one limiter slot.
    pub async fn fetch(&self, key: EntityKey) -> Result<FetchOutcome, FetchError> {
        self.fetch_timed(key).await.1
    }

    /// Like [`fetch`](Self::fetch), also returning the time the fetch itself
    /// took: from its first request to its result, excluding the wait for a
    /// slot and for a pause set before it started.
    pub async fn fetch_timed(&self, key: EntityKey) -> (Duration, Result<FetchOutcome, FetchError>) {
        self.limiter
            .schedule(async {
                self.limiter.wait_for_pause().await;
                let started = Instant::now();
                let result = self.fetch_with_retries(key).await;
                (started.elapsed(), result)
            })
            .await
    }

    async fn fetch_with_retries(&self, key: EntityKey) -> Result<FetchOutcome, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempts_left = attempt < max_attempts;

            self.limiter.wait_for_pause().await;
            let response = match self.transport.get_history(key).await {
                Ok(response) => response,
                Err(source) if attempts_left => {
                    let delay = self.backoff(attempt);
                    warn!(
                        type_id = key.type_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(source) => {
                    return Err(FetchError::Transport {
                        type_id: key.type_id,
                        attempts: attempt,
                        source,
                    });
                }
            };

            self.limiter.adjust_from_headers(&response.headers);
            self.pause_on_low_budget(key, &response.headers);

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                if !attempts_left {
                    return Err(FetchError::RateLimited {
                        type_id: key.type_id,
                        attempts: attempt,
                    });
                }
                let delay = retry_after(&response.headers).unwrap_or(Duration::from_secs(u64::from(attempt) * 2));
                warn!(
                    type_id = key.type_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit hit, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if response.status.is_server_error() && attempts_left {
                let delay = self.backoff(attempt);
                warn!(
                    type_id = key.type_id,
                    attempt,
                    status = response.status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "upstream server error, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return decode(key, attempt, response);
        }
    }

    fn pause_on_low_budget(&self, key: EntityKey, headers: &HeaderMap) {
        let Some(pacing) = &self.pacing else {
            return;
        };
        let delay = pacing
            .delay_for(&rate_limit_headers(headers), &error_limit_headers(headers))
            .total();
        if !delay.is_zero() {
            debug!(type_id = key.type_id, delay_ms = delay.as_millis() as u64, "upstream budget low");
            self.limiter.pause_for(delay);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(&self.policy, attempt, &mut rand::rng())
    }
}

fn decode(key: EntityKey, attempts: u32, response: RawResponse) -> Result<FetchOutcome, FetchError> {
    if !response.is_success() {
        return Err(FetchError::Status {
            type_id: key.type_id,
            status: response.status.to_string(),
            body: response.body,
        });
    }

    let buckets: Vec<MarketHistoryBucket> =
        serde_json::from_str(&response.body).map_err(|source| FetchError::Decode {
            type_id: key.type_id,
            source,
        })?;
    debug!(type_id = key.type_id, buckets = buckets.len(), attempts, "history fetched");

    Ok(FetchOutcome {
        buckets,
        cache: cache_headers(&response.headers),
        rate_limit: rate_limit_headers(&response.headers),
        error_limit: error_limit_headers(&response.headers),
        attempts,
    })
}
