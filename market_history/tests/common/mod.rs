//! Shared helpers for the integration tests: a scripted upstream and bucket builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use http::StatusCode;
use tokio::time::Instant;
use lib_common::retrieve::{header_map, RawResponse};
use market_history::config::IngestConfig;
use market_history::error::TransportError;
use market_history::fetcher::RetryPolicy;
use market_history::limiter::LimiterConfig;
use market_history::{
    EntityKey, HistoryTransport, IngestionOrchestrator, MarketHistoryBucket, MemoryStore, RateAdaptiveLimiter,
    RetryingFetcher,
};

pub const REGION: i64 = 10000002;

/// One scripted upstream reply.
pub enum Reply {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    Transport(String),
}

impl Reply {
    pub fn ok(body: String) -> Self {
        Self::with_headers(200, &[], body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::with_headers(status, &[], body.to_string())
    }

    pub fn with_headers(status: u16, headers: &[(&str, &str)], body: String) -> Self {
        Self::Response {
            status,
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            body,
        }
    }
}

#[derive(Default)]
struct ScriptState {
    replies: Mutex<HashMap<i64, VecDeque<Reply>>>,
    calls: Mutex<HashMap<i64, usize>>,
    requested_at: Mutex<Vec<(i64, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Upstream double: per-type reply queues, an empty history once a queue runs
/// dry, request timestamps and in-flight accounting.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request takes `latency` of (virtual) time.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(&self, type_id: i64, reply: Reply) -> &Self {
        self.state
            .replies
            .lock()
            .unwrap()
            .entry(type_id)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self, type_id: i64) -> usize {
        self.state.calls.lock().unwrap().get(&type_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().values().sum()
    }

    /// When the first request for `type_id` was issued.
    pub fn first_request_at(&self, type_id: i64) -> Option<Instant> {
        self.state
            .requested_at
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == type_id)
            .map(|(_, at)| *at)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, type_id: i64) -> Result<RawResponse, TransportError> {
        *self.state.calls.lock().unwrap().entry(type_id).or_default() += 1;
        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .get_mut(&type_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::ok("[]".to_string()));

        match reply {
            Reply::Response { status, headers, body } => Ok(RawResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: header_map(headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
                body,
            }),
            Reply::Transport(message) => Err(TransportError::new(message)),
        }
    }
}

impl HistoryTransport for ScriptedTransport {
    async fn get_history(&self, key: EntityKey) -> Result<RawResponse, TransportError> {
        self.state.requested_at.lock().unwrap().push((key.type_id, Instant::now()));
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.next_reply(key.type_id);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// Calendar day `n` days before today (UTC).
pub fn days_ago(n: u64) -> NaiveDate {
    Utc::now().date_naive() - Days::new(n)
}

pub fn bucket(date: NaiveDate) -> MarketHistoryBucket {
    MarketHistoryBucket {
        date,
        average: 5.25,
        highest: 5.75,
        lowest: 4.9,
        volume: 1_200_000,
        order_count: Some(412),
        median: None,
    }
}

/// Buckets for each of the given day offsets.
pub fn buckets_days_ago(offsets: &[u64]) -> Vec<MarketHistoryBucket> {
    offsets.iter().map(|n| bucket(days_ago(*n))).collect()
}

/// Upstream JSON body for `buckets`.
pub fn history_body(buckets: &[MarketHistoryBucket]) -> String {
    serde_json::to_string(buckets).unwrap()
}

pub fn key(type_id: i64) -> EntityKey {
    EntityKey::new(type_id, REGION)
}

/// Orchestrator over `store` and `transport` without progress output.
pub fn orchestrator(
    store: &Arc<MemoryStore>,
    transport: &ScriptedTransport,
    limiter: LimiterConfig,
) -> IngestionOrchestrator<MemoryStore, ScriptedTransport> {
    let config = IngestConfig {
        limiter,
        ..IngestConfig::default()
    };
    let fetcher = RetryingFetcher::new(
        transport.clone(),
        Arc::new(RateAdaptiveLimiter::new(limiter)),
        RetryPolicy::default(),
    );
    IngestionOrchestrator::new(Arc::clone(store), fetcher, &config).with_progress(false)
}
