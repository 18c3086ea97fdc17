//! Crawl configuration.
//!
//! Settings come from three layers, highest precedence first: command-line
//! flags (see [`crate::cli::Cli`]), an optional YAML file, and the defaults
//! below. The defaults reproduce the courtesy settings the source site
//! tolerates: one request at a time, 25–40 seconds apart, one retry before
//! switching egress path.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::ConfigError;

/// External anonymizing proxy program launched for the session.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AnonymizerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Line on the program's stdout that means it is ready, e.g.
    /// `Bootstrapped 100%` for tor. Without it the launch returns at once.
    #[serde(default)]
    pub ready_marker: Option<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    90
}

impl AnonymizerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlConfig {
    /// Anonymized exit, `host:port` (SOCKS5) or a full proxy URL.
    pub proxy: Option<String>,
    /// Retries on one path before the router is asked for another.
    pub retry_limit: u32,
    /// Maximum requests in flight for the session.
    pub concurrency: usize,
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub request_timeout_secs: u64,
    /// HTTP statuses treated as rate limiting.
    pub rate_limit_statuses: Vec<u16>,
    /// Tournament season recorded with every stat row.
    pub season: String,
    pub verification_url: String,
    /// Text the verification page must contain when reached through the exit.
    pub verification_marker: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub anonymizer: Option<AnonymizerConfig>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            retry_limit: 1,
            concurrency: 1,
            delay_min_secs: 25.0,
            delay_max_secs: 40.0,
            backoff_base_ms: 1_000,
            backoff_max_secs: 30,
            request_timeout_secs: 30,
            rate_limit_statuses: vec![503, 429],
            season: "2023/2024".to_string(),
            verification_url: "https://check.torproject.org/".to_string(),
            verification_marker: "Congratulations".to_string(),
            accept_language: "en-US,en;q=0.5".to_string(),
            referer: None,
            anonymizer: None,
        }
    }
}

impl CrawlConfig {
    /// Load a YAML config file; missing keys fall back to defaults.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_yaml_str(&raw).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!("Loaded crawl configuration");
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        let finite = self.delay_min_secs.is_finite() && self.delay_max_secs.is_finite();
        if !finite || self.delay_min_secs < 0.0 || self.delay_max_secs < 0.0 {
            return Err(ConfigError::NegativeDelay);
        }
        if self.delay_min_secs > self.delay_max_secs {
            return Err(ConfigError::InvertedDelay {
                min: self.delay_min_secs,
                max: self.delay_max_secs,
            });
        }
        Ok(())
    }

    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs_f64(self.delay_min_secs),
            Duration::from_secs_f64(self.delay_max_secs),
        )
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Proxy URL for the anonymized exit. Bare `host:port` means SOCKS5 with
    /// remote DNS so lookups also leave through the exit.
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.as_deref().map(|endpoint| {
            let endpoint = endpoint.trim();
            if endpoint.contains("://") {
                endpoint.to_string()
            } else {
                format!("socks5h://{endpoint}")
            }
        })
    }
}
