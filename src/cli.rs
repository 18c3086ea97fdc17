//! Command-line interface definitions for Squad Stats.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every argument can be provided via command-line flag or environment
//! variable; crawl settings given here override the YAML config file.

use clap::Parser;
use std::path::PathBuf;

use crate::config::CrawlConfig;

/// Command-line arguments for the Squad Stats ingester.
///
/// # Examples
///
/// ```sh
/// # Ingest the pages listed in a URL file
/// squad_stats -d stats.sqlite -n "Manchester City" -t https://site/team/281 -u urls.json
///
/// # Re-ingest every player already stored for the team, through tor
/// squad_stats -d stats.sqlite -n "Manchester City" -t https://site/team/281 \
///     --config crawl.yaml --proxy 127.0.0.1:9050
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// SQLite database file
    #[arg(short, long, env = "SQUAD_STATS_DATABASE")]
    pub database: PathBuf,

    /// Display name of the team
    #[arg(short = 'n', long, env = "SQUAD_STATS_TEAM_NAME")]
    pub team_name: String,

    /// Source page URL of the team
    #[arg(short = 't', long, env = "SQUAD_STATS_TEAM_URL")]
    pub team_url: String,

    /// JSON array of player page URLs; defaults to the players already stored for the team
    #[arg(short, long)]
    pub urls: Option<PathBuf>,

    /// Where to write the per-URL records
    #[arg(short, long, default_value = "ingest_records.json")]
    pub output: PathBuf,

    /// Also write the de-duplicated URL list to this file
    #[arg(long)]
    pub export_urls: Option<PathBuf>,

    /// Optional path to config.yaml file
    #[arg(short, long, env = "SQUAD_STATS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Anonymized exit, `host:port` (SOCKS5) or proxy URL
    #[arg(long, env = "SQUAD_STATS_PROXY")]
    pub proxy: Option<String>,

    /// Retries per egress path before switching or giving up
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Maximum requests in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Lower bound of the courtesy delay between requests, in seconds
    #[arg(long)]
    pub min_delay: Option<f64>,

    /// Upper bound of the courtesy delay between requests, in seconds
    #[arg(long)]
    pub max_delay: Option<f64>,

    /// Season label stored with every tournament
    #[arg(long)]
    pub season: Option<String>,

    /// Stop dispatching new URLs after this many seconds
    #[arg(long)]
    pub batch_timeout: Option<u64>,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    pub fn apply_overrides(&self, config: &mut CrawlConfig) {
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = retry_limit;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(min_delay) = self.min_delay {
            config.delay_min_secs = min_delay;
        }
        if let Some(max_delay) = self.max_delay {
            config.delay_max_secs = max_delay;
        }
        if let Some(season) = &self.season {
            config.season = season.clone();
        }
    }
}
