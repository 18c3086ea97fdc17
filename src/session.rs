//! One ingestion batch: a team and the player pages that belong to it.
//!
//! For every URL the session validates it, upserts the player, fetches the
//! page, extracts the statistics, refreshes the player's profile, replaces
//! the stat rows and emits one [`IngestRecord`]. Failures stay local to
//! their URL except for loss of the database itself, which stops dispatch
//! for the rest of the batch.
//!
//! Dispatch also stops when the stop flag is raised (interrupt or batch
//! timeout). Jobs already running finish; URLs not yet started are counted
//! as skipped.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::{Future, pending};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::error::{IngestError, StoreError};
use crate::fetch::{ExitProbe, FetchScheduler, PageSource};
use crate::models::{IngestRecord, PlayerStatistics};
use crate::scrapers::{extract_player_profile, extract_player_statistics};
use crate::store::Store;
use crate::utils::is_absolute_http_url;

/// The team a batch of player pages belongs to.
#[derive(Debug, Clone)]
pub struct TeamIdentity {
    pub name: String,
    pub source_url: String,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub team_id: i64,
    pub records: Vec<IngestRecord>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Why the batch was cut short by a backend failure, if it was.
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.skipped == 0
    }
}

/// What ended [`wait_for_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    TimedOut,
}

/// Resolve once `interrupt` fires or `batch_timeout` elapses. If listening
/// for the interrupt fails, only the timeout is left armed.
pub async fn wait_for_stop<F>(interrupt: F, batch_timeout: Option<Duration>) -> StopReason
where
    F: Future<Output = std::io::Result<()>>,
{
    let interrupted = async {
        if let Err(e) = interrupt.await {
            error!(error = %e, "Cannot listen for interrupts; only the batch timeout can stop the batch");
            pending::<()>().await;
        }
    };
    let deadline = async {
        match batch_timeout {
            Some(limit) => sleep(limit).await,
            None => pending::<()>().await,
        }
    };
    tokio::select! {
        _ = interrupted => StopReason::Interrupted,
        _ = deadline => StopReason::TimedOut,
    }
}

pub struct IngestSession<S, P> {
    scheduler: FetchScheduler<S, P>,
    store: Store,
    season: String,
    concurrency: usize,
    stop: Arc<AtomicBool>,
    fatal: Mutex<Option<String>>,
}

impl<S, P> IngestSession<S, P>
where
    S: PageSource,
    P: ExitProbe,
{
    pub fn new(scheduler: FetchScheduler<S, P>, store: Store, season: &str, concurrency: usize) -> Self {
        Self {
            scheduler,
            store,
            season: season.to_string(),
            concurrency: concurrency.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            fatal: Mutex::new(None),
        }
    }

    /// Raise this flag to stop dispatching new URLs.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn scheduler(&self) -> &FetchScheduler<S, P> {
        &self.scheduler
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Ingest `urls` for `team`. Only a failure to record the team itself is
    /// an error; everything after that is reported per URL.
    #[instrument(level = "info", skip_all, fields(team = %team.name, urls = urls.len()))]
    pub async fn run(&self, team: &TeamIdentity, urls: &[String]) -> Result<BatchReport, StoreError> {
        let team_id = self.store.upsert_team(&team.name, &team.source_url)?;
        info!(team_id, concurrency = self.concurrency, "Starting ingestion batch");

        let outcomes: Vec<Option<IngestRecord>> = stream::iter(urls.iter())
            .map(|url| self.ingest_one(team_id, url))
            .buffered(self.concurrency)
            .collect()
            .await;

        let records: Vec<IngestRecord> = outcomes.into_iter().flatten().collect();
        let succeeded = records.iter().filter(|r| r.is_success()).count();
        let report = BatchReport {
            team_id,
            succeeded,
            failed: records.len() - succeeded,
            skipped: urls.len() - records.len(),
            aborted: self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            records,
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            aborted = report.aborted.is_some(),
            "Ingestion batch finished"
        );
        Ok(report)
    }

    async fn ingest_one(&self, team_id: i64, url: &str) -> Option<IngestRecord> {
        if self.is_stopping() {
            info!(%url, "Batch stopping; URL skipped");
            return None;
        }
        if !is_absolute_http_url(url) {
            let err = StoreError::Validation(format!("not an absolute http(s) URL: {url:?}"));
            return Some(self.fail(url, None, err.into()));
        }

        let player_id = match self.register_player(team_id, url) {
            Ok(player_id) => player_id,
            Err(err) => return Some(self.fail(url, None, err.into())),
        };

        let page = match self.scheduler.fetch(url).await {
            Ok(page) => page,
            Err(err) => return Some(self.fail(url, Some(player_id), err)),
        };

        let (statistics, shape_error) = match extract_player_statistics(&page.body) {
            Ok(statistics) => (statistics, None),
            Err(err) => (
                PlayerStatistics::without_rows(extract_player_profile(&page.body)),
                Some(err),
            ),
        };

        if let Err(err) = self.persist(player_id, &statistics) {
            return Some(self.fail(url, Some(player_id), err.into()));
        }

        Some(match shape_error {
            None => {
                info!(
                    %url,
                    player_id,
                    tournaments = statistics.seasons.len(),
                    "Player ingested"
                );
                IngestRecord::success(url, player_id, statistics)
            }
            Some(err) => self
                .fail(url, Some(player_id), err.into())
                .with_statistics(statistics),
        })
    }

    fn register_player(&self, team_id: i64, url: &str) -> Result<i64, StoreError> {
        self.store.upsert_player(Some(team_id), url)?;
        self.store
            .player_id(url)?
            .ok_or_else(|| StoreError::Validation(format!("player row missing after upsert: {url}")))
    }

    fn persist(&self, player_id: i64, statistics: &PlayerStatistics) -> Result<usize, StoreError> {
        self.store
            .update_player_profile(player_id, &statistics.name, &statistics.position)?;
        self.store
            .replace_player_stats(player_id, &statistics.seasons, &self.season)
    }

    /// Log the failure, stop the batch if the database is gone, and build
    /// the failed record.
    fn fail(&self, url: &str, entity_id: Option<i64>, err: IngestError) -> IngestRecord {
        if let IngestError::Store(store_err) = &err {
            if store_err.is_backend_lost() {
                error!(%url, kind = err.kind(), error = %err, "Database unavailable; stopping batch");
                self.stop.store(true, Ordering::SeqCst);
                self.fatal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert_with(|| err.to_string());
                return IngestRecord::failed(url, entity_id, &err);
            }
        }
        match &err {
            IngestError::ExtractionShape(_) | IngestError::HttpStatus { .. } => {
                warn!(%url, kind = err.kind(), error = %err, "URL failed")
            }
            _ => error!(%url, kind = err.kind(), error = %err, "URL failed"),
        }
        IngestRecord::failed(url, entity_id, &err)
    }
}
