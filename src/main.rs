//! # Squad Stats
//!
//! A resilient ingestion pipeline for per-player tournament statistics.
//! Given a team and the URLs of its players' statistics pages, it fetches
//! each page, extracts the per-tournament rows and totals, and stores them
//! in SQLite, replacing whatever the previous run stored for that player.
//!
//! ## Features
//!
//! - Courtesy pacing: randomized delay between requests, one request in
//!   flight by default
//! - Retries with exponential backoff for rate limiting and network errors
//! - Switches the whole session to an anonymized exit (SOCKS5, e.g. tor) once
//!   the direct path is rate limited, and stays there after it works
//! - Role-aware extraction: goalkeepers get goals conceded and clean sheets
//!   instead of goals and assists
//! - Idempotent storage: re-ingesting a page yields the same rows
//!
//! ## Usage
//!
//! ```sh
//! squad_stats -d stats.sqlite -n "Manchester City" -t https://site/team/281 -u urls.json
//! ```
//!
//! ## Architecture
//!
//! 1. **Input**: read the URL list (or the team's stored players), de-duplicate
//! 2. **Fetching**: [`fetch::FetchScheduler`] with [`egress::EgressRouter`]
//! 3. **Extraction**: [`scrapers::extract_player_statistics`]
//! 4. **Persistence**: [`store::Store`]
//! 5. **Output**: one JSON record per URL plus a summary line

use clap::Parser;
use itertools::Itertools;
use std::error::Error;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod anonymizer;
mod cli;
mod config;
mod egress;
mod error;
mod fetch;
mod models;
mod outputs;
mod scrapers;
mod session;
mod store;
mod utils;

use anonymizer::AnonymizerProcess;
use cli::Cli;
use config::CrawlConfig;
use fetch::{FetchPolicy, FetchScheduler, HttpExitProbe, HttpPageSource};
use outputs::json;
use session::{IngestSession, StopReason, TeamIdentity, wait_for_stop};
use store::Store;
use utils::ensure_writable_parent;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("squad_stats starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args.database, ?args.urls, ?args.output, "Parsed CLI arguments");

    // ---- Configuration: defaults < YAML < flags ----
    let mut config = match &args.config {
        Some(path) => CrawlConfig::from_yaml_file(path)?,
        None => CrawlConfig::default(),
    };
    args.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid crawl configuration");
        return Err(e.into());
    }
    info!(
        retry_limit = config.retry_limit,
        concurrency = config.concurrency,
        delay_min_secs = config.delay_min_secs,
        delay_max_secs = config.delay_max_secs,
        proxy = config.proxy.is_some(),
        season = %config.season,
        "Crawl configuration ready"
    );

    // Early check: ensure the records file can be written
    if let Err(e) = ensure_writable_parent(&args.output).await {
        error!(
            path = %args.output.display(),
            error = %e,
            "Output location is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let store = Store::open(&args.database)?;
    let team = TeamIdentity {
        name: args.team_name.clone(),
        source_url: args.team_url.clone(),
    };

    // ---- Player URLs ----
    let raw_urls = match &args.urls {
        Some(path) => json::read_url_list(path).await?,
        None => match store.team(&team.source_url)? {
            Some(stored_team) => {
                let stored = store.players_by_team(stored_team.team_id)?;
                info!(
                    team_id = stored_team.team_id,
                    count = stored.len(),
                    "Using player URLs stored for the team"
                );
                stored
            }
            None => {
                warn!("Team not in the database yet and no URL file given");
                Vec::new()
            }
        },
    };
    let raw_count = raw_urls.len();
    let urls: Vec<String> = raw_urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unique()
        .collect();
    info!(count = urls.len(), dropped = raw_count - urls.len(), "Loaded player URLs");

    if let Some(path) = &args.export_urls {
        json::write_url_list(&urls, path).await?;
    }
    if urls.is_empty() {
        warn!("No player URLs to ingest");
    }

    // ---- Anonymizer process (optional) ----
    let anonymizer = match &config.anonymizer {
        Some(anonymizer_config) => Some(AnonymizerProcess::launch(anonymizer_config).await?),
        None => None,
    };

    // ---- Session ----
    let source = HttpPageSource::from_config(&config)?;
    let probe = HttpExitProbe::for_source(&source, &config);
    if source.has_anonymized_exit() {
        info!("Anonymized exit configured; it is probed before first use");
    }
    let scheduler = FetchScheduler::new(source, probe, FetchPolicy::from_config(&config));
    let session = IngestSession::new(scheduler, store, &config.season, config.concurrency);

    // Interrupt or batch timeout: stop dispatching, let in-flight work finish.
    let stop = session.stop_handle();
    let batch_timeout = args.batch_timeout.map(Duration::from_secs);
    let watcher = tokio::spawn(async move {
        match wait_for_stop(tokio::signal::ctrl_c(), batch_timeout).await {
            StopReason::Interrupted => warn!("Interrupt received; finishing in-flight work"),
            StopReason::TimedOut => {
                warn!(?batch_timeout, "Batch timeout reached; finishing in-flight work")
            }
        }
        stop.store(true, Ordering::SeqCst);
    });

    let result = session.run(&team, &urls).await;
    watcher.abort();
    if let Some(process) = anonymizer {
        process.shutdown().await;
    }
    let report = result?;

    if let Err(e) = json::write_records(&report.records, &args.output).await {
        error!(path = %args.output.display(), error = %e, "Failed to write records");
    }

    let tournaments = session
        .store()
        .tournaments(&config.season)
        .map(|rows| rows.len())
        .unwrap_or_default();
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        tournaments,
        final_path = %session.scheduler().current_path(),
        "Execution complete"
    );
    println!(
        "succeeded: {}  failed: {}  skipped: {}",
        report.succeeded, report.failed, report.skipped
    );

    if !report.is_complete() {
        warn!(
            skipped = report.skipped,
            "Batch incomplete; rerun to ingest the remaining URLs"
        );
    }
    if let Some(reason) = report.aborted {
        error!(%reason, "Batch aborted");
        return Err(format!("batch aborted: {reason}").into());
    }
    Ok(())
}
