//! Page fetching with retry, backoff and egress routing.
//!
//! # Architecture
//!
//! - [`PageSource`]: one HTTP attempt over a given egress path
//! - [`HttpPageSource`]: the `reqwest` implementation, one client per path
//! - [`ExitProbe`] / [`HttpExitProbe`]: reachability check for the
//!   anonymized exit
//! - [`FetchScheduler`]: drives one job per URL through
//!   `Pending → InFlight → {Succeeded | Retrying | Failed}`, asking the
//!   [`EgressRouter`] which path to use and reporting every outcome back
//!
//! # Retry Strategy
//!
//! Every dispatch waits a random courtesy delay drawn from the configured
//! range. Retries additionally back off exponentially:
//! ```text
//! delay = min(base * 2^(attempt-1), max) + random_jitter(0..250ms)
//! ```
//! A rate-limited request gets `retry_limit` retries per path. When those
//! are spent the router may hand it a new path with a fresh budget.

use rand::seq::IndexedRandom;
use rand::{Rng, rng};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::{Client, Proxy, redirect};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CrawlConfig;
use crate::egress::{Attempt, EgressPath, EgressRouter, Outcome};
use crate::error::{FetchError, IngestError};
use crate::models::FetchedPage;
use crate::utils::truncate_for_log;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

fn random_user_agent() -> String {
    USER_AGENTS
        .choose(&mut rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
        .to_string()
}

/// A single HTTP attempt over a chosen egress path.
pub trait PageSource {
    /// Fetch `url`. Any HTTP status is `Ok`; only transport failures are
    /// errors.
    async fn fetch(
        &self,
        url: &str,
        path: EgressPath,
        user_agent: &str,
    ) -> Result<FetchedPage, FetchError>;
}

/// Reachability check for the anonymized exit.
pub trait ExitProbe {
    async fn probe(&self) -> bool;
}

/// `reqwest`-backed [`PageSource`] with a direct client and, when a proxy is
/// configured, a client routed through the anonymized exit.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    direct: Client,
    anonymized: Option<Client>,
}

impl HttpPageSource {
    pub fn from_config(config: &CrawlConfig) -> Result<Self, reqwest::Error> {
        let direct = build_client(config, None)?;
        let anonymized = config
            .proxy_url()
            .map(|proxy| build_client(config, Some(&proxy)))
            .transpose()?;
        Ok(Self { direct, anonymized })
    }

    pub fn has_anonymized_exit(&self) -> bool {
        self.anonymized.is_some()
    }

    fn client_for(&self, path: EgressPath) -> Option<&Client> {
        match path {
            EgressPath::Direct => Some(&self.direct),
            EgressPath::Anonymized => self.anonymized.as_ref(),
        }
    }
}

fn build_client(config: &CrawlConfig, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    if let Ok(language) = HeaderValue::from_str(&config.accept_language) {
        headers.insert(ACCEPT_LANGUAGE, language);
    }
    if let Some(referer) = config
        .referer
        .as_deref()
        .and_then(|r| HeaderValue::from_str(r).ok())
    {
        headers.insert(REFERER, referer);
    }

    let mut builder = Client::builder()
        .timeout(config.request_timeout())
        .redirect(redirect::Policy::none())
        .default_headers(headers);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl PageSource for HttpPageSource {
    #[instrument(level = "debug", skip(self, user_agent), fields(%path))]
    async fn fetch(
        &self,
        url: &str,
        path: EgressPath,
        user_agent: &str,
    ) -> Result<FetchedPage, FetchError> {
        let client = self
            .client_for(path)
            .ok_or_else(|| FetchError::Transient(format!("no client for {path} egress")))?;
        let t0 = Instant::now();
        let response = client
            .get(url)
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        debug!(
            status,
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched page"
        );
        Ok(FetchedPage {
            url: url.to_string(),
            status,
            body,
        })
    }
}

/// Fetches a verification page through the anonymized exit and checks for a
/// marker that the page only shows to traffic arriving through that network.
#[derive(Debug, Clone)]
pub struct HttpExitProbe {
    client: Client,
    url: String,
    marker: String,
}

impl HttpExitProbe {
    /// `None` when the source has no anonymized exit to probe.
    pub fn for_source(source: &HttpPageSource, config: &CrawlConfig) -> Option<Self> {
        source.anonymized.clone().map(|client| Self {
            client,
            url: config.verification_url.clone(),
            marker: config.verification_marker.clone(),
        })
    }
}

impl ExitProbe for HttpExitProbe {
    #[instrument(level = "info", skip(self), fields(url = %self.url))]
    async fn probe(&self) -> bool {
        let response = match self
            .client
            .get(&self.url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Exit probe request failed");
                return false;
            }
        };
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Exit probe got non-success status");
            return false;
        }
        match response.text().await {
            Ok(body) => {
                let routed = self.marker.is_empty() || body.contains(&self.marker);
                if !routed {
                    warn!(
                        body_preview = %truncate_for_log(&body, 200),
                        "Exit probe page lacks verification marker"
                    );
                }
                routed
            }
            Err(e) => {
                warn!(error = %e, "Exit probe body unreadable");
                false
            }
        }
    }
}

/// Timing and classification knobs for the scheduler.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub retry_limit: u32,
    pub concurrency: usize,
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_statuses: Vec<u16>,
}

impl FetchPolicy {
    pub fn from_config(config: &CrawlConfig) -> Self {
        let (delay_min, delay_max) = config.delay_range();
        Self {
            retry_limit: config.retry_limit,
            concurrency: config.concurrency.max(1),
            delay_min,
            delay_max,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            rate_limit_statuses: config.rate_limit_statuses.clone(),
        }
    }

    fn is_rate_limited(&self, status: u16) -> bool {
        self.rate_limit_statuses.contains(&status)
    }

    fn courtesy_delay(&self) -> Duration {
        if self.delay_max <= self.delay_min {
            return self.delay_min;
        }
        let secs = rng().random_range(self.delay_min.as_secs_f64()..=self.delay_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1 << shift).min(self.backoff_max);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Succeeded)
                | (InFlight, Retrying)
                | (InFlight, Failed)
                | (Retrying, InFlight)
                | (Retrying, Failed)
        )
    }
}

/// Book-keeping for one URL.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    pub state: JobState,
    pub path: EgressPath,
    /// Total dispatches so far.
    pub attempts: u32,
    /// Retries spent on the current path.
    pub retry_count: u32,
}

impl FetchJob {
    pub fn new(url: &str, path: EgressPath) -> Self {
        Self {
            url: url.to_string(),
            state: JobState::Pending,
            path,
            attempts: 0,
            retry_count: 0,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid job transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(url = %self.url, from = ?self.state, to = ?next, "Job state change");
        self.state = next;
    }

    fn attempt(&self) -> Attempt {
        Attempt {
            path: self.path,
            retry_count: self.retry_count,
        }
    }
}

/// Drives fetch jobs for one crawl session.
///
/// Owns the session's [`EgressRouter`] and user agent, and caps the number
/// of requests in flight at the policy's concurrency.
pub struct FetchScheduler<S, P> {
    source: S,
    probe: Option<P>,
    router: Mutex<EgressRouter>,
    user_agent: Mutex<String>,
    policy: FetchPolicy,
    slots: Semaphore,
}

impl<S, P> FetchScheduler<S, P>
where
    S: PageSource,
    P: ExitProbe,
{
    /// `probe` is `None` when there is no anonymized exit; the router then
    /// never leaves the direct path.
    pub fn new(source: S, probe: Option<P>, policy: FetchPolicy) -> Self {
        let router = EgressRouter::new(probe.is_some(), policy.retry_limit);
        let user_agent = random_user_agent();
        info!(%user_agent, concurrency = policy.concurrency, "Fetch session user agent chosen");
        Self {
            source,
            probe,
            router: Mutex::new(router),
            user_agent: Mutex::new(user_agent),
            slots: Semaphore::new(policy.concurrency.max(1)),
            policy,
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    fn router(&self) -> MutexGuard<'_, EgressRouter> {
        self.router.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_path(&self) -> EgressPath {
        self.router().current_path()
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rotate_user_agent(&self) {
        let next = random_user_agent();
        debug!(user_agent = %next, "Rotated user agent for new egress path");
        *self.user_agent.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn report(&self, attempt: &Attempt, outcome: Outcome) -> Option<EgressPath> {
        self.router().report_outcome(attempt, outcome)
    }

    async fn probe_exit_if_needed(&self, attempt: &Attempt) {
        if !self.router().needs_probe(attempt) {
            return;
        }
        let healthy = match &self.probe {
            Some(probe) => probe.probe().await,
            None => false,
        };
        self.router().record_probe(healthy);
    }

    async fn dispatch(&self, job: &mut FetchJob) -> Result<FetchedPage, FetchError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| FetchError::Transient("fetch scheduler closed".to_string()))?;
        sleep(self.policy.courtesy_delay()).await;
        job.attempts += 1;
        job.advance(JobState::InFlight);
        let user_agent = self.user_agent();
        self.source.fetch(&job.url, job.path, &user_agent).await
    }

    /// Move the job into `Retrying`, wait out the backoff and pick the path
    /// for the next dispatch.
    async fn retry_on(&self, job: &mut FetchJob, next: EgressPath) {
        job.advance(JobState::Retrying);
        if next != job.path {
            job.retry_count = 0;
            job.path = next;
        } else {
            job.retry_count += 1;
        }
        let delay = self.policy.backoff(job.attempts);
        warn!(
            url = %job.url,
            attempt = job.attempts,
            retry_count = job.retry_count,
            path = %job.path,
            ?delay,
            "Retrying fetch"
        );
        sleep(delay).await;
    }

    /// Fetch one URL to completion: a 2xx page or a terminal failure.
    #[instrument(level = "info", skip(self), fields(%url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, IngestError> {
        let mut job = FetchJob::new(url, self.current_path());
        loop {
            let result = self.dispatch(&mut job).await;
            let attempt = job.attempt();

            match result {
                Ok(page) if (200..300).contains(&page.status) => {
                    self.report(&attempt, Outcome::Success);
                    job.advance(JobState::Succeeded);
                    info!(
                        page_url = %page.url,
                        attempts = job.attempts,
                        path = %job.path,
                        exit_confirmed = self.router().is_confirmed(),
                        "Fetch succeeded"
                    );
                    return Ok(page);
                }
                Ok(page) if self.policy.is_rate_limited(page.status) => {
                    if job.retry_count < self.policy.retry_limit {
                        self.report(&attempt, Outcome::RateLimited);
                        let next = self.current_path();
                        self.retry_on(&mut job, next).await;
                        continue;
                    }
                    self.probe_exit_if_needed(&attempt).await;
                    match self.report(&attempt, Outcome::RateLimited) {
                        Some(next) => {
                            self.rotate_user_agent();
                            self.retry_on(&mut job, next).await;
                        }
                        None => {
                            job.advance(JobState::Failed);
                            error!(status = page.status, attempts = job.attempts, "Rate limited with no egress path left");
                            return Err(IngestError::RateLimited {
                                status: page.status,
                            });
                        }
                    }
                }
                Ok(page) => {
                    self.report(&attempt, Outcome::OtherError);
                    job.advance(JobState::Failed);
                    warn!(
                        status = page.status,
                        body_preview = %truncate_for_log(&page.body, 200),
                        "Unexpected HTTP status"
                    );
                    return Err(IngestError::HttpStatus {
                        status: page.status,
                    });
                }
                Err(FetchError::Transient(message)) => {
                    self.report(&attempt, Outcome::OtherError);
                    if job.retry_count < self.policy.retry_limit {
                        warn!(error = %message, "Transient network error");
                        let next = self.current_path();
                        self.retry_on(&mut job, next).await;
                        continue;
                    }
                    job.advance(JobState::Failed);
                    error!(error = %message, attempts = job.attempts, "Network error after retries");
                    return Err(IngestError::TransientNetwork(message));
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures::future::join_all;

    const DIRECT: EgressPath = EgressPath::Direct;
    const ANON: EgressPath = EgressPath::Anonymized;

    #[tokio::test]
    async fn test_success_first_try() {
        let source = ScriptedSource::new("<html></html>");
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));

        let page = scheduler.fetch("https://example.com/a").await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(scheduler.source.paths(), vec![DIRECT]);
    }

    #[tokio::test]
    async fn test_rate_limit_switches_and_sticks() {
        let source = ScriptedSource::new("ok")
            .then(DIRECT, Ok(503))
            .then(DIRECT, Ok(503));
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));

        scheduler.fetch("https://example.com/a").await.unwrap();
        assert_eq!(scheduler.current_path(), ANON);
        assert!(scheduler.router().is_confirmed());

        // Direct would answer 200 now, but the session stays anonymized.
        scheduler.fetch("https://example.com/b").await.unwrap();
        scheduler.fetch("https://example.com/c").await.unwrap();
        assert_eq!(
            scheduler.source.paths(),
            vec![DIRECT, DIRECT, ANON, ANON, ANON]
        );
    }

    #[tokio::test]
    async fn test_failed_probe_makes_rate_limit_terminal() {
        let source = ScriptedSource::new("").otherwise(DIRECT, 503);
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(false)), quick_policy(1));

        let err = scheduler.fetch("https://example.com/a").await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited { status: 503 }));
        assert_eq!(scheduler.current_path(), DIRECT);
        assert_eq!(scheduler.source.paths(), vec![DIRECT, DIRECT]);
    }

    #[tokio::test]
    async fn test_no_exit_configured_fails_after_budget() {
        let source = ScriptedSource::new("").otherwise(DIRECT, 429);
        let scheduler: FetchScheduler<_, FixedProbe> =
            FetchScheduler::new(source, None, quick_policy(2));

        let err = scheduler.fetch("https://example.com/a").await.unwrap_err();
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(scheduler.source.paths().len(), 3);
    }

    #[tokio::test]
    async fn test_anonymized_exhaustion_fails_and_stays_anonymized() {
        let source = ScriptedSource::new("ok")
            .otherwise(DIRECT, 503)
            .then(ANON, Ok(503))
            .then(ANON, Ok(503));
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));

        let err = scheduler.fetch("https://example.com/a").await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited { status: 503 }));
        assert_eq!(scheduler.source.paths(), vec![DIRECT, DIRECT, ANON, ANON]);
        assert_eq!(scheduler.current_path(), ANON);
        assert!(!scheduler.router().is_confirmed());

        // The next URL goes straight to the anonymized exit.
        scheduler.fetch("https://example.com/b").await.unwrap();
        assert_eq!(
            scheduler.source.paths(),
            vec![DIRECT, DIRECT, ANON, ANON, ANON]
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_within_budget() {
        let source = ScriptedSource::new("ok")
            .then(DIRECT, Err(FetchError::Transient("connection reset".into())));
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));
        assert!(scheduler.fetch("https://example.com/a").await.is_ok());

        let source = ScriptedSource::new("ok")
            .then(DIRECT, Err(FetchError::Transient("timeout".into())))
            .then(DIRECT, Err(FetchError::Transient("timeout".into())));
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));
        let err = scheduler.fetch("https://example.com/a").await.unwrap_err();
        assert_eq!(err.kind(), "transient_network");
        assert_eq!(scheduler.current_path(), DIRECT);
    }

    #[tokio::test]
    async fn test_other_status_is_terminal_without_retry() {
        let source = ScriptedSource::new("gone").otherwise(DIRECT, 404);
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(3));

        let err = scheduler.fetch("https://example.com/a").await.unwrap_err();
        assert!(matches!(err, IngestError::HttpStatus { status: 404 }));
        assert_eq!(scheduler.source.paths().len(), 1);
    }

    #[tokio::test]
    async fn test_user_agent_is_per_session_until_switch() {
        let source = ScriptedSource::new("ok");
        let scheduler = FetchScheduler::new(source, Some(FixedProbe(true)), quick_policy(1));
        scheduler.fetch("https://example.com/a").await.unwrap();
        scheduler.fetch("https://example.com/b").await.unwrap();

        let calls = scheduler.source.calls.lock().unwrap();
        assert_eq!(calls[0].2, calls[1].2);
        assert!(USER_AGENTS.contains(&calls[0].2.as_str()));
    }

    #[tokio::test]
    async fn test_single_slot_serializes_requests() {
        let scheduler =
            FetchScheduler::new(CountingSource::new("ok"), Some(FixedProbe(true)), quick_policy(1));
        let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/{i}")).collect();

        let results = join_all(urls.iter().map(|url| scheduler.fetch(url))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(scheduler.source.peak(), 1);
    }

    #[tokio::test]
    async fn test_requests_in_flight_never_exceed_cap() {
        let policy = FetchPolicy {
            concurrency: 3,
            ..quick_policy(1)
        };
        let scheduler = FetchScheduler::new(CountingSource::new("ok"), Some(FixedProbe(true)), policy);
        let urls: Vec<String> = (0..8).map(|i| format!("https://example.com/{i}")).collect();

        let results = join_all(urls.iter().map(|url| scheduler.fetch(url))).await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(scheduler.source.peak(), 3);
    }

    #[test]
    fn test_job_state_transitions() {
        use JobState::*;
        assert!(Pending.can_advance_to(InFlight));
        assert!(InFlight.can_advance_to(Retrying));
        assert!(Retrying.can_advance_to(InFlight));
        assert!(Retrying.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Succeeded));
        assert!(!Succeeded.can_advance_to(InFlight));
        assert!(!Failed.can_advance_to(Retrying));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = FetchPolicy {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            ..quick_policy(1)
        };
        assert!(policy.backoff(1) >= Duration::from_secs(1));
        assert!(policy.backoff(1) <= Duration::from_millis(1_250));
        assert!(policy.backoff(10) <= Duration::from_millis(5_250));
        assert_eq!(quick_policy(1).backoff(4), Duration::ZERO);
    }

    #[test]
    fn test_courtesy_delay_within_range() {
        let policy = FetchPolicy {
            delay_min: Duration::from_millis(10),
            delay_max: Duration::from_millis(20),
            ..quick_policy(1)
        };
        for _ in 0..50 {
            let delay = policy.courtesy_delay();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }
}
