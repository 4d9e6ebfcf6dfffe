//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! Every response, including non-2xx ones, is handed back as a `RawResponse`
//! so callers can inspect rate-limit and caching headers on each attempt.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use thiserror::Error;

/// Errors raised before a response status is available.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The base URL or the joined path is not a valid absolute URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The request could not be sent or the body could not be read.
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A raw HTTP response: status, headers and the body as text.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The headers returned by the server.
    pub headers: HeaderMap,
    /// The full response body.
    pub body: String,
}

impl RawResponse {
    /// Indicates if the status code was in the 2xx range.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A flexible asynchronous HTTP client.
///
/// Handles base URLs and default headers.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying reqwest client.
    inner: reqwest::Client,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient`.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "https://api.example.com/v1/").
    /// * `user_agent` - Value sent as `User-Agent` on every request.
    /// * `timeout` - Per-request timeout covering connect, send and body read.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUrl` if `base_url` is not absolute.
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, HttpError> {
        let url = Url::parse(base_url)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(user_agent) {
            default_headers.insert(USER_AGENT, agent);
        }

        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()?;

        Ok(Self { inner, base_url: url })
    }

    /// The base URL all request paths are joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a GET request and returns the raw response whatever its status.
    ///
    /// # Arguments
    /// * `path` - The relative path to append to the base URL.
    /// * `query` - Query string pairs.
    /// * `headers` - Optional additional headers for this specific request.
    pub async fn get_raw(
        &self,
        path: &str,
        query: &[(&str, String)],
        headers: Option<HeaderMap>,
    ) -> Result<RawResponse, HttpError> {
        self.request_raw(Method::GET, path, query, headers).await
    }

    /// Performs a request with the given method and returns the raw response.
    pub async fn request_raw(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        headers: Option<HeaderMap>,
    ) -> Result<RawResponse, HttpError> {
        // 1. Construct the full absolute URL
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url).query(query);

        // 2. Add custom headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Execute and capture everything the caller may need
        let response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            headers: resp_headers,
            body,
        })
    }
}

/// Builds a `HeaderMap` from string pairs, skipping invalid names or values.
pub fn header_map<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(h_name), Ok(h_value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.append(h_name, h_value);
        }
    }
    headers
}
