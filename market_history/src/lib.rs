//! # market_history
//!
//! Incremental ingestion of daily market price history from the ESI market
//! history endpoint into PostgreSQL.
//!
//! A run walks an ordered list of item types for one region. For each type it
//! consults a persisted freshness hint, fetches history through an adaptive
//! concurrency limiter with retry and backoff, diffs the returned daily
//! buckets against what storage already holds inside the lookback window and
//! writes only the missing days. Upstream rate and error budgets drive both
//! the limiter and a post-fetch pacing pause.
//!
//! - **`orchestrator`**: the per-run loop and summary.
//! - **`fetcher`** / **`limiter`** / **`pacing`** / **`headers`**: upstream access.
//! - **`reconciler`** / **`freshness`** / **`storage`**: persistence.
//! - **`entity_source`** / **`config`**: run inputs.
//! - **`progress`** / **`reporter`**: run outputs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod entity_source;
pub mod error;
pub mod fetcher;
pub mod freshness;
pub mod headers;
pub mod limiter;
pub mod model;
pub mod orchestrator;
pub mod pacing;
pub mod progress;
pub mod reconciler;
pub mod reporter;
pub mod storage;

pub use config::{IngestConfig, RunOptions};
pub use error::{FetchError, IngestError, StoreError};
pub use fetcher::{EsiTransport, HistoryTransport, RetryingFetcher};
pub use limiter::RateAdaptiveLimiter;
pub use model::{EntityKey, IngestionStatus, IngestionSummaryEntry, MarketHistoryBucket, RunSummary, Source};
pub use orchestrator::IngestionOrchestrator;
pub use storage::{HistoryStore, MemoryStore, PostgresStore};
