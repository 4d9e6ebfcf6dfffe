//! # Data Retrieval Module
//!
//! This module provides a centralized location for HTTP clients used by the
//! ingestion tooling.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A thin `ApiClient` built on `reqwest`. It joins paths onto
//!   a base URL, injects default headers and returns the raw status, headers
//!   and body of every response, success or not. Retry and backoff policy is
//!   deliberately left to callers, which know which statuses are transient
//!   for their upstream.

/// Raw HTTP API client returning status, headers and body.
pub mod ky_http;

pub use ky_http::{header_map, ApiClient, HttpError, RawResponse};
