//! # Progress Stream
//!
//! One line per processed entity. On a terminal the line overwrites itself
//! and the status is colored; otherwise each line is printed plainly. The
//! format is for humans and carries no compatibility promise.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use colored::{ColoredString, Colorize};

use crate::headers::{CacheHeaders, ErrorLimitHeaders, RateLimitHeaders};
use crate::model::{IngestionStatus, Source};

/// Everything shown for one entity.
#[derive(Debug, Clone)]
pub struct ProgressContext<'a> {
    /// Entities processed so far, including this one.
    pub processed: usize,
    /// Entities in the run.
    pub total: usize,
    /// Estimated time to completion.
    pub eta: Duration,
    /// Entity type id.
    pub type_id: i64,
    /// Candidate source.
    pub source: Source,
    /// Candidates inside the window.
    pub attempted: usize,
    /// Candidates absent from storage.
    pub missing: usize,
    /// Buckets written.
    pub inserted: usize,
    /// Buckets skipped.
    pub skipped: usize,
    /// Entity status.
    pub status: IngestionStatus,
    /// Rate-limit snapshot.
    pub rate_limit: &'a RateLimitHeaders,
    /// Error-budget snapshot.
    pub error_limit: &'a ErrorLimitHeaders,
    /// Freshness hints.
    pub cache: &'a CacheHeaders,
}

/// `XhYYm`, `XmYYs` or `Ns`, rounded to whole seconds.
pub fn format_eta(eta: Duration) -> String {
    let total_seconds = (eta.as_millis() as f64 / 1000.0).round() as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Percentage with one decimal; `0.0%` when not finite.
pub fn format_percentage(value: f64) -> String {
    if value.is_finite() {
        format!("{:.1}%", value)
    } else {
        "0.0%".to_string()
    }
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

/// Builds the progress line with `status` rendered by `paint`.
fn render(context: &ProgressContext<'_>, paint: impl Fn(IngestionStatus) -> String) -> String {
    let percentage = if context.total > 0 {
        format_percentage(context.processed as f64 / context.total as f64 * 100.0)
    } else {
        "0.0%".to_string()
    };

    [
        format!("[{}/{}]", context.processed, context.total),
        percentage,
        format!("eta={}", format_eta(context.eta)),
        format!("type={}", context.type_id),
        format!("source={}", context.source),
        format!("attempted={}", context.attempted),
        format!("missing={}", context.missing),
        format!("inserted={}", context.inserted),
        format!("skipped={}", context.skipped),
        format!("status={}", paint(context.status)),
        format!("rateRemain={}", or_na(context.rate_limit.remaining)),
        format!("errorRemain={}", or_na(context.error_limit.remain)),
        format!("cacheExpires={}", or_na(context.cache.expires.as_deref())),
        format!("cacheLastMod={}", or_na(context.cache.last_modified.as_deref())),
        format!("etag={}", or_na(context.cache.etag.as_deref())),
    ]
    .join(" ")
}

/// Plain progress line.
pub fn build_progress_line(context: &ProgressContext<'_>) -> String {
    render(context, |status| status.to_string())
}

fn paint_status(status: IngestionStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        IngestionStatus::Ingested => text.bright_green(),
        IngestionStatus::UpToDate | IngestionStatus::CacheValid => text.bright_white(),
        IngestionStatus::DryRun => text.bright_cyan(),
        IngestionStatus::Error => text.bright_red(),
    }
}

/// # ProgressWriter
///
/// Writes progress lines to stdout, overwriting in place on a terminal.
#[derive(Debug)]
pub struct ProgressWriter {
    interactive: bool,
    last_len: usize,
}

impl Default for ProgressWriter {
    fn default() -> Self {
        Self::new(io::stdout().is_terminal())
    }
}

impl ProgressWriter {
    /// Writer with explicit terminal behavior.
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            last_len: 0,
        }
    }

    /// Emits one line. The last line of a run ends with a newline on a terminal.
    pub fn write(&mut self, context: &ProgressContext<'_>) {
        let stdout = io::stdout();
        let mut out = stdout.lock();

        if !self.interactive {
            let _ = writeln!(out, "{}", build_progress_line(context));
            return;
        }

        let plain_len = build_progress_line(context).chars().count();
        let line = render(context, |status| paint_status(status).to_string());
        let padding = " ".repeat(self.last_len.saturating_sub(plain_len));
        let last = context.processed >= context.total;

        let _ = write!(out, "{}{}{}", line, padding, if last { "\n" } else { "\r" });
        let _ = out.flush();
        self.last_len = if last { 0 } else { plain_len.max(self.last_len) };
    }

    /// Blanks a pending self-overwriting line before other output.
    pub fn clear(&mut self) {
        if !self.interactive || self.last_len == 0 {
            return;
        }
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = write!(out, "{}\r", " ".repeat(self.last_len));
        let _ = out.flush();
        self.last_len = 0;
    }
}
