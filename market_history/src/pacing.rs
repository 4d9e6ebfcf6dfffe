//! # Adaptive Pacing
//!
//! After each real upstream fetch the orchestrator sleeps longer the closer
//! the reported rate-limit or error-limit budget is to its threshold. The two
//! threshold/sleep pairs are independent of each other and of the limiter.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::headers::{ErrorLimitHeaders, RateLimitHeaders};

/// Thresholds and sleep units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Rate-limit remaining at or below which pacing starts.
    pub rate_threshold: i64,
    /// Sleep unit per token under the rate threshold.
    pub rate_sleep: Duration,
    /// Error budget at or below which pacing starts.
    pub error_threshold: i64,
    /// Flat sleep when the error budget is low.
    pub error_sleep: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            rate_threshold: 25,
            rate_sleep: Duration::from_millis(2_000),
            error_threshold: 10,
            error_sleep: Duration::from_millis(5_000),
        }
    }
}

/// Delays chosen for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacingDelay {
    /// Delay from the rate-limit budget.
    pub rate: Duration,
    /// Delay from the error budget.
    pub error: Duration,
}

impl PacingDelay {
    /// Combined delay.
    pub fn total(&self) -> Duration {
        self.rate + self.error
    }
}

/// Cumulative pacing delay of a run, reported in the metrics artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacingTotals {
    /// Milliseconds slept for the rate-limit budget.
    pub rate_delay_ms: u64,
    /// Milliseconds slept for the error budget.
    pub error_delay_ms: u64,
}

impl PacingTotals {
    /// Adds one response's delays.
    pub fn record(&mut self, delay: &PacingDelay) {
        self.rate_delay_ms = self.rate_delay_ms.saturating_add(millis(delay.rate));
        self.error_delay_ms = self.error_delay_ms.saturating_add(millis(delay.error));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PacingPolicy {
    /// Computes the delays for one response without sleeping.
    pub fn delay_for(&self, rate: &RateLimitHeaders, errors: &ErrorLimitHeaders) -> PacingDelay {
        let mut delay = PacingDelay::default();

        if let Some(remaining) = rate.remaining.filter(|r| *r <= self.rate_threshold) {
            let shortfall = self.rate_threshold.saturating_sub(remaining).saturating_add(1).max(1);
            let units = u32::try_from(shortfall).unwrap_or(u32::MAX);
            delay.rate = self.rate_sleep.saturating_mul(units);
        }
        if errors.remain.is_some_and(|remain| remain <= self.error_threshold) {
            delay.error = self.error_sleep;
        }

        delay
    }

    /// Sleeps for the computed delays and adds them to `totals`.
    pub async fn pace(
        &self,
        type_id: i64,
        rate: &RateLimitHeaders,
        errors: &ErrorLimitHeaders,
        totals: &mut PacingTotals,
    ) -> PacingDelay {
        let delay = self.delay_for(rate, errors);

        if !delay.rate.is_zero() {
            info!(
                type_id,
                remaining = ?rate.remaining,
                delay_ms = delay.rate.as_millis() as u64,
                "rate-limit cushion low, pausing"
            );
            tokio::time::sleep(delay.rate).await;
        }
        if !delay.error.is_zero() {
            warn!(
                type_id,
                remain = ?errors.remain,
                delay_ms = delay.error.as_millis() as u64,
                "error-limit cushion low, pausing"
            );
            tokio::time::sleep(delay.error).await;
        }

        totals.record(&delay);
        delay
    }
}
