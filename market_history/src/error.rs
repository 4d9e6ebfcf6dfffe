//! # Error Types
//!
//! One enum per concern. Per-entity failures (`FetchError`, `StoreError`,
//! `ReconcileError`) fold into `IngestError`, which the orchestrator records
//! against the entity before moving on. `ConfigError` and `EntityListError`
//! only occur at startup and abort the run before any entity is processed.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// A transport-level failure: no HTTP status was received.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Wraps any displayable failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<lib_common::retrieve::HttpError> for TransportError {
    fn from(err: lib_common::retrieve::HttpError) -> Self {
        Self(err.to_string())
    }
}

/// Terminal outcome of a remote history fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream answered with a non-retryable status, or a 5xx on the last attempt.
    #[error("ESI request failed for type {type_id}: {status}{}", body_suffix(.body))]
    Status {
        /// Entity being fetched.
        type_id: i64,
        /// HTTP status code and reason.
        status: String,
        /// Response body, verbatim.
        body: String,
    },
    /// Every attempt was answered with 429.
    #[error("ESI rate limit persisted for type {type_id} after {attempts} attempts")]
    RateLimited {
        /// Entity being fetched.
        type_id: i64,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The request never produced a response on the final attempt.
    #[error("ESI transport failure for type {type_id} after {attempts} attempts: {source}")]
    Transport {
        /// Entity being fetched.
        type_id: i64,
        /// Number of attempts made.
        attempts: u32,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// A 2xx body that is not a history array.
    #[error("ESI returned an undecodable history payload for type {type_id}: {source}")]
    Decode {
        /// Entity being fetched.
        type_id: i64,
        /// JSON decoding error.
        #[source]
        source: serde_json::Error,
    },
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" - {}", body)
    }
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Pool or connection level failure.
    #[error(transparent)]
    Db(#[from] lib_common::connections::DbError),
    /// Statement failure.
    #[error("Query execution failed: {0}")]
    Query(#[from] tokio_postgres::Error),
    /// A row did not have the expected shape.
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    /// The backing store refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures while merging buckets into storage.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A candidate bucket violates the bucket invariants; nothing was written.
    #[error("Invalid bucket for type {type_id} on {date}: {reason}")]
    InvalidBucket {
        /// Entity owning the bucket.
        type_id: i64,
        /// Bucket day.
        date: NaiveDate,
        /// Violated invariant.
        reason: String,
    },
    /// The store rejected the read or the write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything that can fail a single entity.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Remote fetch failed terminally.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    /// The spawned fetch task panicked or was cancelled.
    #[error("Fetch task for type {type_id} did not complete: {message}")]
    TaskFailed {
        /// Entity being fetched.
        type_id: i64,
        /// Join error description.
        message: String,
    },
}

/// Failures loading entity lists or fixtures.
#[derive(Debug, Error)]
pub enum EntityListError {
    /// The file could not be read.
    #[error("Unable to read type list from {path}: {source}")]
    Unreadable {
        /// Requested path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },
    /// No parser strategy produced a single type id.
    #[error("Unrecognised format for type list {path}")]
    Unrecognised {
        /// Requested path.
        path: PathBuf,
    },
    /// The fixture file is not a `{typeId: Bucket[]}` document.
    #[error("Invalid fixture {path}: {source}")]
    InvalidFixture {
        /// Requested path.
        path: PathBuf,
        /// JSON decoding error.
        #[source]
        source: serde_json::Error,
    },
    /// Resolving eligible entities from storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid run arguments.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric argument that must be positive was not.
    #[error("Invalid {name}: {value}")]
    NotPositive {
        /// Argument name.
        name: &'static str,
        /// Rejected value.
        value: i64,
    },
}

/// Failures writing run artifacts.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Directory creation or file write failed.
    #[error("Report I/O failed for {path}: {source}")]
    Io {
        /// Target path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Payload serialization failed.
    #[error("Report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
