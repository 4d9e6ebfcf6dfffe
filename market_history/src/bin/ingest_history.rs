//! # ingest_history
//!
//! Command-line entry point for a market history ingestion run.
//!
//! Startup failures (bad arguments, unreadable type list, no database) abort
//! with a non-zero exit code before any entity is processed. Once the run has
//! started, per-type failures are reported in the JSON summary printed to
//! stdout and never change the exit code.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueHint};
use tracing::info;

use lib_common::configs::{env_string, load_dotenv};
use lib_common::connections::Database;
use lib_common::loggers::setup_logging;
use lib_common::retrieve::ApiClient;
use market_history::config::{DEFAULT_DAYS, DEFAULT_REGION_ID};
use market_history::entity_source::{EntityRequest, load_fixture, resolve_entities};
use market_history::reporter::RunReporter;
use market_history::{
    EsiTransport, IngestConfig, IngestionOrchestrator, PostgresStore, RateAdaptiveLimiter, RetryingFetcher, RunOptions,
};

const APP_NAME: &str = "ingest_history";
const USER_AGENT: &str = concat!("market_history/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments for ingest_history.
#[derive(Parser, Debug)]
#[clap(
    name = "ingest_history",
    version,
    author = "ckir",
    about = "Ingests daily market price history into PostgreSQL.",
    long_about = "Fetches market history for each requested type in a region, writes only the days \
                  missing from storage inside the lookback window and prints a JSON run summary. \
                  Without --type or --types-from, every eligible type in storage is processed."
)]
struct Cli {
    /// Region to ingest.
    #[clap(long, env = "MARKET_INGEST_REGION_ID", default_value_t = DEFAULT_REGION_ID, allow_negative_numbers = true)]
    region: i64,

    /// Lookback window in days.
    #[clap(long, env = "MARKET_INGEST_DAYS", default_value_t = DEFAULT_DAYS, allow_negative_numbers = true)]
    days: i64,

    /// Type id to ingest; repeatable.
    #[clap(long = "type", value_name = "TYPE_ID", action = ArgAction::Append, allow_negative_numbers = true)]
    types: Vec<i64>,

    /// Maximum number of types to process.
    #[clap(long, value_name = "N")]
    type_limit: Option<usize>,

    /// File listing type ids (JSON, newline or comma separated).
    #[clap(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    types_from: Option<PathBuf>,

    /// Fixture file mapping type ids to history buckets, used instead of ESI for listed types.
    #[clap(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    fixture: Option<PathBuf>,

    /// Identify missing days without writing them.
    #[clap(long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Fetch even when the freshness cache says a type is fresh.
    #[clap(long, action = ArgAction::SetTrue)]
    ignore_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env before clap so env-backed arguments see it
    load_dotenv();
    let cli = Cli::parse();

    let log_dir = PathBuf::from(env_string("LOG_DIR").unwrap_or_else(|| "logs".to_string()));
    let _guard = setup_logging(APP_NAME, &log_dir, "info").context("Failed to initialize logging")?;

    let options = RunOptions::new(cli.region, cli.days, cli.dry_run, cli.ignore_cache).context("Invalid run options")?;
    let config = IngestConfig::from_env();

    let database_url = config.database_url.as_deref().context("DATABASE_URL is not set")?;
    let db = Database::new(database_url, config.limiter.max + 2).context("Failed to create database pool")?;
    db.ping().await.context("Database is unreachable")?;
    let store = Arc::new(PostgresStore::new(db));
    store.ensure_schema().await.context("Failed to prepare schema")?;

    let request = EntityRequest {
        explicit: &cli.types,
        file: cli.types_from.as_deref(),
        type_limit: cli.type_limit,
    };
    let type_ids = resolve_entities(&request, store.as_ref())
        .await
        .context("Failed to resolve type ids")?;

    let client = ApiClient::new(&config.esi_base_url, USER_AGENT, HTTP_TIMEOUT).context("Failed to build ESI client")?;
    let limiter = Arc::new(RateAdaptiveLimiter::new(config.limiter));
    let fetcher = RetryingFetcher::new(EsiTransport::new(client), limiter, config.retry);

    let mut orchestrator =
        IngestionOrchestrator::new(store, fetcher, &config).with_reporter(RunReporter::new(config.report_dir.clone()));
    if let Some(path) = &cli.fixture {
        let fixtures = load_fixture(path)
            .await
            .with_context(|| format!("Failed to load fixture {}", path.display()))?;
        info!(types = fixtures.len(), path = %path.display(), "fixture loaded");
        orchestrator = orchestrator.with_fixtures(fixtures);
    }

    let summary = orchestrator.run(&type_ids, &options).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
