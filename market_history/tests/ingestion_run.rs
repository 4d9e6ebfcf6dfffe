mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use market_history::config::RunOptions;
use market_history::limiter::LimiterConfig;
use market_history::{IngestionStatus, MemoryStore, Source};

use common::{bucket, buckets_days_ago, days_ago, history_body, key, orchestrator, Reply, ScriptedTransport, REGION};

fn options(days: i64) -> RunOptions {
    RunOptions::new(REGION, days, false, false).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cache_short_circuits_fetch() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let seeded_check = Utc::now() - chrono::Duration::hours(2);
    store.seed_cache(key(100), Utc::now() + chrono::Duration::hours(1), seeded_check);

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[100], &options(90))
        .await;

    let entry = &summary.entries[0];
    assert_eq!(entry.status, IngestionStatus::CacheValid);
    assert_eq!(entry.source, Source::Cache);
    assert_eq!(transport.calls(100), 0);
    assert!(store.cache_row(key(100)).unwrap().last_checked_at > seeded_check);
    assert_eq!(summary.status_counts().cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ignore_cache_fetches_anyway() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    store.seed_cache(key(100), Utc::now() + chrono::Duration::hours(1), Utc::now());
    transport.script(100, Reply::ok(history_body(&buckets_days_ago(&[1]))));

    let run = RunOptions {
        ignore_cache: true,
        ..options(90)
    };
    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[100], &run)
        .await;

    assert_eq!(transport.calls(100), 1);
    assert_eq!(summary.entries[0].status, IngestionStatus::Ingested);
    assert_eq!(summary.entries[0].inserted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_reports_missing_without_writing() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport.script(200, Reply::ok(history_body(&buckets_days_ago(&[1, 2, 3]))));

    let run = RunOptions::new(REGION, 7, true, false).unwrap();
    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[200], &run)
        .await;

    let entry = &summary.entries[0];
    assert_eq!(entry.status, IngestionStatus::DryRun);
    assert_eq!(entry.missing, 3);
    assert_eq!(entry.inserted, 0);
    assert_eq!(entry.skipped, 3);
    assert_eq!(entry.message.as_deref(), Some("dry run"));
    assert!(store.buckets(key(200)).is_empty());
    assert_eq!(summary.totals.skipped, 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_inserts_nothing() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let history = history_body(&buckets_days_ago(&[1, 2, 3, 40]));
    transport.script(34, Reply::ok(history.clone()));
    transport.script(34, Reply::ok(history));

    let run = RunOptions {
        ignore_cache: true,
        ..options(30)
    };
    let first = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34], &run)
        .await;
    let second = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34], &run)
        .await;

    assert_eq!(first.entries[0].attempted, 3);
    assert_eq!(first.entries[0].inserted, 3);
    assert_eq!(second.entries[0].inserted, 0);
    assert_eq!(second.entries[0].existing, 3);
    assert_eq!(second.entries[0].status, IngestionStatus::UpToDate);
    assert_eq!(second.entries[0].latest.map(|l| l.date_naive()), Some(days_ago(1)));
    assert_eq!(store.buckets(key(34)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_only_missing_days_are_written() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    store.seed_buckets(key(35), [bucket(days_ago(2))]);
    transport.script(35, Reply::ok(history_body(&buckets_days_ago(&[1, 2, 3]))));

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[35], &options(30))
        .await;

    let entry = &summary.entries[0];
    assert_eq!(entry.status, IngestionStatus::Ingested);
    assert_eq!((entry.attempted, entry.missing, entry.inserted, entry.existing), (3, 2, 2, 1));
    assert_eq!(store.buckets(key(35)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_type_does_not_stop_the_run() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport.script(36, Reply::status(404, r#"{"error":"Type not found!"}"#));
    for type_id in [34, 35, 37, 38] {
        transport.script(type_id, Reply::ok(history_body(&buckets_days_ago(&[1]))));
    }
    let ids = [36, 34, 35, 37, 38];

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&ids, &options(30))
        .await;

    assert_eq!(summary.processed_types, 5);
    assert_eq!(summary.totals.errors, 1);
    let failures = summary.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].type_id, 36);
    assert!(failures[0].message.as_deref().unwrap().contains("Type not found!"));
    assert!(store.cache_row(key(36)).is_none());

    let order: Vec<i64> = summary.entries.iter().map(|e| e.type_id).collect();
    assert_eq!(order, ids);
    assert_eq!(summary.totals.inserted, 4);
}

#[tokio::test(start_paused = true)]
async fn test_storage_failure_is_isolated() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    store.fail_type(35);
    for type_id in [34, 35, 36] {
        transport.script(type_id, Reply::ok(history_body(&buckets_days_ago(&[1]))));
    }

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34, 35, 36], &options(30))
        .await;

    let statuses: Vec<IngestionStatus> = summary.entries.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        [IngestionStatus::Ingested, IngestionStatus::Error, IngestionStatus::Ingested]
    );
    assert_eq!(summary.entries[1].source, Source::Esi);
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_are_retried_until_success() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport
        .script(34, Reply::status(503, "unavailable"))
        .script(34, Reply::Transport("connection reset".into()))
        .script(34, Reply::ok(history_body(&buckets_days_ago(&[1, 2]))));

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34], &options(30))
        .await;

    assert_eq!(transport.calls(34), 3);
    assert_eq!(summary.entries[0].inserted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_low_rate_budget_paces_the_run() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport.script(
        34,
        Reply::with_headers(200, &[("x-ratelimit-remaining", "5")], history_body(&buckets_days_ago(&[1]))),
    );
    transport.script(
        35,
        Reply::with_headers(200, &[("x-esi-error-limit-remain", "8")], history_body(&buckets_days_ago(&[1]))),
    );

    let started = Instant::now();
    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34, 35], &options(30))
        .await;

    // 2s per unit below threshold 25: (25 - 5 + 1) units
    assert_eq!(summary.limiter.rate_delay_ms, 42_000);
    assert_eq!(summary.limiter.error_delay_ms, 5_000);
    assert!(started.elapsed() >= Duration::from_secs(47));
    assert_eq!(summary.entries[0].rate_limit.remaining, Some(5));
}

/// Type 34 reports an exhausted rate budget; 35 to 37 are already spawned behind it.
fn exhausted_budget_run(transport: &ScriptedTransport) {
    transport.script(
        34,
        Reply::with_headers(200, &[("x-ratelimit-remaining", "0")], history_body(&buckets_days_ago(&[1]))),
    );
    for type_id in [35, 36, 37] {
        transport.script(type_id, Reply::ok(history_body(&buckets_days_ago(&[1]))));
    }
}

#[tokio::test(start_paused = true)]
async fn test_low_budget_holds_back_queued_fetches() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::with_latency(Duration::from_millis(100));
    exhausted_budget_run(&transport);
    let limiter = LimiterConfig { initial: 1, min: 1, max: 4 };

    let started = Instant::now();
    let summary = orchestrator(&store, &transport, limiter)
        .run(&[34, 35, 36, 37], &options(30))
        .await;

    // (25 - 0 + 1) units of 2s, counted from the response to 34
    let resume = started + Duration::from_millis(100) + Duration::from_secs(52);
    for type_id in [35, 36, 37] {
        let at = transport.first_request_at(type_id).unwrap();
        assert!(at >= resume, "type {type_id} requested {:?} after start", at - started);
    }
    assert_eq!(summary.limiter.rate_delay_ms, 52_000);
    assert_eq!(summary.totals.inserted, 4);
}

#[tokio::test(start_paused = true)]
async fn test_entry_duration_excludes_other_entities_pacing() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::with_latency(Duration::from_millis(100));
    exhausted_budget_run(&transport);
    let limiter = LimiterConfig { initial: 1, min: 1, max: 4 };

    let summary = orchestrator(&store, &transport, limiter)
        .run(&[34, 35, 36, 37], &options(30))
        .await;

    for entry in &summary.entries {
        assert!(
            (100..1_000).contains(&entry.duration_ms),
            "type {} took {}ms",
            entry.type_id,
            entry.duration_ms
        );
    }
    assert!(summary.duration_ms >= 52_000);
}

#[tokio::test(start_paused = true)]
async fn test_expires_header_sets_freshness() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    let expires = Utc::now() + chrono::Duration::minutes(30);
    transport.script(
        34,
        Reply::with_headers(200, &[("expires", &expires.to_rfc2822())], history_body(&buckets_days_ago(&[1]))),
    );
    transport.script(35, Reply::ok(history_body(&buckets_days_ago(&[1]))));

    orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34, 35], &options(30))
        .await;

    let hinted = store.cache_row(key(34)).unwrap();
    assert_eq!(hinted.cached_until.timestamp(), expires.timestamp());

    let fallback = store.cache_row(key(35)).unwrap().cached_until - Utc::now();
    assert!(fallback > chrono::Duration::minutes(170) && fallback <= chrono::Duration::minutes(180));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_fetches_stay_within_limiter_bound() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::with_latency(Duration::from_millis(250));
    let limiter = LimiterConfig { initial: 3, min: 1, max: 3 };
    let ids: Vec<i64> = (1..=12).collect();

    let summary = orchestrator(&store, &transport, limiter).run(&ids, &options(30)).await;

    assert_eq!(summary.processed_types, 12);
    assert_eq!(transport.total_calls(), 12);
    assert!(transport.max_in_flight() <= 3, "{}", transport.max_in_flight());
    assert!(transport.max_in_flight() >= 2, "fetches were not overlapped");
}

#[tokio::test(start_paused = true)]
async fn test_summary_serializes_for_stdout() {
    let store = Arc::new(MemoryStore::new());
    let transport = ScriptedTransport::new();
    transport.script(34, Reply::ok(history_body(&buckets_days_ago(&[1]))));

    let summary = orchestrator(&store, &transport, LimiterConfig::default())
        .run(&[34], &options(30))
        .await;
    let json = serde_json::to_value(&summary).unwrap();

    assert_eq!(json["regionId"], REGION);
    assert_eq!(json["processedTypes"], 1);
    assert_eq!(json["totals"]["inserted"], 1);
    assert_eq!(json["entries"][0]["status"], "ingested");
    assert_eq!(json["entries"][0]["source"], "esi");
}
