//! # Rate-Adaptive Limiter
//!
//! Bounds the number of concurrent outbound requests and nudges that bound
//! up or down from the upstream error-budget headers.
//!
//! Admission is cooperative: a task waiting for a slot parks on a
//! `tokio::sync::Notify` instead of blocking a thread. The slot is held by a
//! guard, so it is released when the task finishes, fails or is dropped.
//!
//! The limiter also carries a pause deadline. Callers check it with
//! `wait_for_pause` right before each outbound request, so a low upstream
//! budget reported by one response holds back requests that other tasks
//! already have queued.

use std::future::Future;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::headers::{error_limit_headers, ErrorLimitHeaders};

/// Error budget at or below which concurrency shrinks.
const SHRINK_REMAIN: i64 = 5;
/// Error budget at or above which concurrency grows when the reset is known.
const GROW_REMAIN_WITH_RESET: i64 = 80;
/// Error budget at or above which concurrency grows when the reset is unknown.
const GROW_REMAIN: i64 = 50;
/// Longest pause honoured; larger requests are clamped.
const MAX_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

/// Concurrency bounds of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Starting concurrency.
    pub initial: usize,
    /// Lower bound, at least 1.
    pub min: usize,
    /// Upper bound, at least `min`.
    pub max: usize,
}

impl LimiterConfig {
    /// Forces `1 <= min <= initial <= max`.
    pub fn normalized(self) -> Self {
        let min = self.min.max(1);
        let max = self.max.max(min);
        let initial = self.initial.clamp(min, max);
        Self { initial, min, max }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial: 6,
            min: 1,
            max: 8,
        }
    }
}

#[derive(Debug)]
struct State {
    active: usize,
    current: usize,
    paused_until: Option<Instant>,
}

/// # RateAdaptiveLimiter
///
/// Shared by every fetch task of a run. The mutable state (in-flight counter,
/// current bound and pause deadline) sits behind one mutex that is never held
/// across an await.
#[derive(Debug)]
pub struct RateAdaptiveLimiter {
    min: usize,
    max: usize,
    state: Mutex<State>,
    notify: Notify,
}

impl RateAdaptiveLimiter {
    /// Creates a limiter from (normalized) bounds.
    pub fn new(config: LimiterConfig) -> Self {
        let config = config.normalized();
        Self {
            min: config.min,
            max: config.max,
            state: Mutex::new(State {
                active: 0,
                current: config.initial,
                paused_until: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Current concurrency bound.
    pub fn concurrency(&self) -> usize {
        self.lock().current
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.lock().active
    }

    /// Upper bound of the concurrency range.
    pub fn max_concurrency(&self) -> usize {
        self.max
    }

    /// Lower bound of the concurrency range.
    pub fn min_concurrency(&self) -> usize {
        self.min
    }

    /// Runs `task` once a slot is free and returns its output.
    ///
    /// The slot is released when `task` completes, whatever its output, or
    /// when the returned future is dropped.
    pub async fn schedule<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        task.await
    }

    /// Adjusts the bound from raw response headers.
    pub fn adjust_from_headers(&self, headers: &HeaderMap) {
        self.adjust_from_error_limit(&error_limit_headers(headers));
    }

    /// Moves the bound by at most one step.
    ///
    /// A nearly exhausted error budget shrinks it; an ample budget grows it.
    /// Tasks already running are unaffected.
    pub fn adjust_from_error_limit(&self, limits: &ErrorLimitHeaders) {
        let Some(remain) = limits.remain else {
            return;
        };

        let grew = {
            let mut state = self.lock();
            let before = state.current;
            if remain <= SHRINK_REMAIN {
                state.current = state.current.saturating_sub(1).max(self.min);
            } else if should_grow(remain, limits.reset) {
                state.current = (state.current + 1).min(self.max);
            }
            if state.current != before {
                debug!(remain, reset = ?limits.reset, from = before, to = state.current, "limiter concurrency adjusted");
            }
            state.current > before
        };

        if grew {
            self.notify.notify_waiters();
        }
    }

    /// Holds back requests that call [`wait_for_pause`](Self::wait_for_pause) for `delay`.
    ///
    /// Overlapping pauses keep the later deadline.
    pub fn pause_for(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let until = Instant::now() + delay.min(MAX_PAUSE);
        let mut state = self.lock();
        if state.paused_until.is_none_or(|current| current < until) {
            debug!(pause_ms = delay.min(MAX_PAUSE).as_millis() as u64, "outbound requests paused");
            state.paused_until = Some(until);
        }
    }

    /// Deadline of the pause in effect, if any.
    pub fn paused_until(&self) -> Option<Instant> {
        self.lock().paused_until.filter(|until| *until > Instant::now())
    }

    /// Returns once no pause is in effect, including pauses extended while waiting.
    pub async fn wait_for_pause(&self) {
        while let Some(until) = self.paused_until() {
            tokio::time::sleep_until(until).await;
        }
    }

    async fn acquire(&self) -> SlotGuard<'_> {
        loop {
            // Register interest before checking so a release in between is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.active < state.current {
                    state.active += 1;
                    return SlotGuard { limiter: self };
                }
            }

            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn should_grow(remain: i64, reset: Option<i64>) -> bool {
    match reset {
        Some(reset) => remain >= GROW_REMAIN_WITH_RESET && reset > 1,
        None => remain >= GROW_REMAIN,
    }
}

struct SlotGuard<'a> {
    limiter: &'a RateAdaptiveLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
