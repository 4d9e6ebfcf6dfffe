//! # Upstream Header Extraction
//!
//! Pure functions over an `http::HeaderMap`. The upstream reports freshness
//! hints, its per-group rate-limit quota and its error budget on every
//! response; these snapshots are consumed immediately by the limiter, the
//! pacing policy and the freshness cache, and copied into summary entries.

use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// `Retry-After`, seconds (429 responses).
pub const RETRY_AFTER: &str = "retry-after";
/// Freshness hint: absolute expiry.
pub const EXPIRES: &str = "expires";
/// Freshness hint: last modification.
pub const LAST_MODIFIED: &str = "last-modified";
/// Freshness hint: entity tag.
pub const ETAG: &str = "etag";
/// Rate-limit quota group.
pub const RATE_LIMIT_GROUP: &str = "x-ratelimit-group";
/// Rate-limit quota, e.g. `150/15m`.
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Tokens remaining in the quota window.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Tokens consumed by this request.
pub const RATE_LIMIT_USED: &str = "x-ratelimit-used";
/// Errors still tolerated in the current window.
pub const ERROR_LIMIT_REMAIN: &str = "x-esi-error-limit-remain";
/// Seconds until the error window resets.
pub const ERROR_LIMIT_RESET: &str = "x-esi-error-limit-reset";

/// Freshness hints of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHeaders {
    /// `Expires` verbatim.
    pub expires: Option<String>,
    /// `Last-Modified` verbatim.
    pub last_modified: Option<String>,
    /// `ETag` verbatim.
    pub etag: Option<String>,
}

/// Rate-limit quota snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitHeaders {
    /// Quota group.
    pub group: Option<String>,
    /// Quota description.
    pub limit: Option<String>,
    /// Remaining tokens.
    pub remaining: Option<i64>,
    /// Tokens used by the request.
    pub used: Option<i64>,
}

/// Error-budget snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLimitHeaders {
    /// Errors remaining in the window.
    pub remain: Option<i64>,
    /// Seconds until reset.
    pub reset: Option<i64>,
}

/// Header value as text, `None` when absent or not visible ASCII.
pub fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Leading integer of a header value (`"12"`, `" 12 "`, `"12.5"` all give 12).
pub fn header_int(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_text(headers, name).and_then(|raw| leading_int(&raw))
}

fn leading_int(raw: &str) -> Option<i64> {
    let end = raw
        .char_indices()
        .find(|(index, c)| !(c.is_ascii_digit() || (*index == 0 && (*c == '-' || *c == '+'))))
        .map(|(index, _)| index)
        .unwrap_or(raw.len());
    raw[..end].parse().ok()
}

/// Extracts freshness hints.
pub fn cache_headers(headers: &HeaderMap) -> CacheHeaders {
    CacheHeaders {
        expires: header_text(headers, EXPIRES),
        last_modified: header_text(headers, LAST_MODIFIED),
        etag: header_text(headers, ETAG),
    }
}

/// Extracts the rate-limit quota snapshot.
pub fn rate_limit_headers(headers: &HeaderMap) -> RateLimitHeaders {
    RateLimitHeaders {
        group: header_text(headers, RATE_LIMIT_GROUP),
        limit: header_text(headers, RATE_LIMIT_LIMIT),
        remaining: header_int(headers, RATE_LIMIT_REMAINING),
        used: header_int(headers, RATE_LIMIT_USED),
    }
}

/// Extracts the error-budget snapshot.
pub fn error_limit_headers(headers: &HeaderMap) -> ErrorLimitHeaders {
    ErrorLimitHeaders {
        remain: header_int(headers, ERROR_LIMIT_REMAIN),
        reset: header_int(headers, ERROR_LIMIT_RESET),
    }
}

/// `Retry-After` as a delay. Only the delta-seconds form is honoured.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_int(headers, RETRY_AFTER)
        .filter(|secs| *secs >= 0)
        .map(|secs| Duration::from_secs(secs as u64))
}
