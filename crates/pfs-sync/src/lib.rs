//! Sync runs (feed -> backend reconciliation), shared run status and the
//! daily scheduler.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local, TimeZone, Utc};
use pfs_backend::{BackendConfig, ListingBackend, TaxonomyVocabulary, WordPressClient};
use pfs_core::{PropertyRecord, ScheduleSnapshot, SyncPhase, SyncStatus, SyncSummary};
use pfs_feed::{FeedError, FeedSource, HttpFeedSource};
use pfs_storage::{FeedSnapshotStore, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pfs-sync";

/// Listings upserted between two progress/counter publications.
pub const UPSERT_BATCH_SIZE: usize = 20;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed_url: String,
    pub backend_url: String,
    pub backend_user: String,
    pub backend_password: Option<String>,
    pub trigger_secret: Option<String>,
    pub post_type: String,
    pub user_agent: String,
    pub feed_timeout_secs: u64,
    pub backend_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub feed_archive_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            feed_url: std::env::var("XML_FEED_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8081/feed.xml".to_string()),
            backend_url: std::env::var("WORDPRESS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            backend_user: std::env::var("WORDPRESS_USER").unwrap_or_else(|_| "admin".to_string()),
            backend_password: non_empty_var("WORDPRESS_PASSWORD"),
            trigger_secret: non_empty_var("CRON_SECRET"),
            post_type: std::env::var("PFS_POST_TYPE").unwrap_or_else(|_| "real-estate".to_string()),
            user_agent: std::env::var("PFS_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            feed_timeout_secs: secs_var("PFS_FEED_TIMEOUT_SECS", 60),
            backend_timeout_secs: secs_var("PFS_BACKEND_TIMEOUT_SECS", 30),
            image_timeout_secs: secs_var("PFS_IMAGE_TIMEOUT_SECS", 45),
            scheduler_enabled: std::env::var("PFS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            feed_archive_dir: non_empty_var("FEED_ARCHIVE_DIR").map(PathBuf::from),
        }
    }

    /// Feed source only; does not need backend credentials.
    pub fn feed_source(&self) -> anyhow::Result<HttpFeedSource> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.feed_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
        .context("building feed http client")?;
        let mut source = HttpFeedSource::new(self.feed_url.clone(), http);
        if let Some(dir) = &self.feed_archive_dir {
            source = source.with_snapshots(FeedSnapshotStore::new(dir.clone()));
        }
        Ok(source)
    }

    pub fn backend(&self) -> anyhow::Result<WordPressClient> {
        let password = self
            .backend_password
            .clone()
            .context("WORDPRESS_PASSWORD must be set to talk to the backend")?;
        let images = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.image_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
        .context("building image http client")?;
        WordPressClient::new(
            BackendConfig {
                base_url: self.backend_url.clone(),
                username: self.backend_user.clone(),
                password,
                post_type: self.post_type.clone(),
                timeout: Duration::from_secs(self.backend_timeout_secs),
                vocabulary: TaxonomyVocabulary::default(),
            },
            images,
        )
    }

    pub fn build_orchestrator(&self) -> anyhow::Result<SyncOrchestrator> {
        let feed = self.feed_source()?;
        let backend = self.backend()?;
        Ok(SyncOrchestrator::new(Arc::new(feed), Arc::new(backend)))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("sync run did not finish: {0}")]
    Interrupted(String),
}

/// First local midnight strictly after `now`, in UTC.
///
/// Zones that skip midnight on a DST change get the first valid hour of
/// that day instead.
pub fn next_midnight_after<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let tz = now.timezone();
    let fallback = now.with_timezone(&Utc) + chrono::Duration::days(1);
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return fallback;
    };
    (0..3u32)
        .filter_map(|hour| tomorrow.and_hms_opt(hour, 0, 0))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or(fallback)
}

fn next_local_midnight() -> DateTime<Utc> {
    next_midnight_after(&Local::now())
}

/// Progress after `processed` of `total` listings were upserted (0..=50).
pub fn upsert_progress(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 50;
    }
    (processed as f64 / total as f64 * 50.0).round() as u8
}

/// Progress after the media step for the listing at `index` (50..=90).
pub fn media_progress(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 90;
    }
    50 + ((index + 1) as f64 / total as f64 * 40.0).round() as u8
}

// The status lock is only ever held for a few field writes and never across
// an await, so blocking on it (including from `Drop`) is short.
fn read_status(lock: &RwLock<SyncStatus>) -> RwLockReadGuard<'_, SyncStatus> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_status(lock: &RwLock<SyncStatus>) -> RwLockWriteGuard<'_, SyncStatus> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive right to run a sync. Releasing it (including on panic) clears
/// the running flag.
pub struct RunGuard {
    running: Arc<AtomicBool>,
    status: Arc<RwLock<SyncStatus>>,
    settled: bool,
}

impl RunGuard {
    fn settle(mut self, apply: impl FnOnce(&mut SyncStatus)) {
        let mut status = write_status(&self.status);
        apply(&mut status);
        status.is_running = false;
        status.current_phase = SyncPhase::Idle;
        drop(status);
        self.settled = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.settled {
            let mut status = write_status(&self.status);
            status.is_running = false;
            status.current_phase = SyncPhase::Idle;
            status
                .last_error
                .get_or_insert_with(|| "sync run ended unexpectedly".to_string());
        }
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    imported: u64,
    updated: u64,
    errors: u64,
}

/// Drives one feed -> backend reconciliation at a time and owns the shared
/// status other components read.
pub struct SyncOrchestrator {
    feed: Arc<dyn FeedSource>,
    backend: Arc<dyn ListingBackend>,
    status: Arc<RwLock<SyncStatus>>,
    running: Arc<AtomicBool>,
}

impl SyncOrchestrator {
    pub fn new(feed: Arc<dyn FeedSource>, backend: Arc<dyn ListingBackend>) -> Self {
        Self {
            feed,
            backend,
            status: Arc::new(RwLock::new(SyncStatus::new(next_local_midnight()))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        read_status(&self.status).clone()
    }

    pub async fn set_next_run(&self, next_run: DateTime<Utc>) {
        write_status(&self.status).next_run = next_run;
    }

    /// Take the run guard and move the status to `Fetching`.
    pub async fn begin(&self) -> Result<RunGuard, SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyRunning)?;
        let guard = RunGuard {
            running: Arc::clone(&self.running),
            status: Arc::clone(&self.status),
            settled: false,
        };

        let mut status = write_status(&self.status);
        status.is_running = true;
        status.current_progress = 0;
        status.current_phase = SyncPhase::Fetching;
        Ok(guard)
    }

    pub async fn run_to_completion(&self) -> Result<SyncSummary, SyncError> {
        let guard = self.begin().await?;
        self.run(guard).await
    }

    /// Execute the run on its own task and wait for it. Dropping the returned
    /// future only stops waiting; the run itself carries on to completion.
    pub async fn run_detached(self: &Arc<Self>, guard: RunGuard) -> Result<SyncSummary, SyncError> {
        let orchestrator = Arc::clone(self);
        match tokio::spawn(async move { orchestrator.run(guard).await }).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "sync run task failed");
                Err(SyncError::Interrupted(err.to_string()))
            }
        }
    }

    /// Execute a run for which `guard` was taken. The status always ends in
    /// the idle phase with the guard released.
    pub async fn run(&self, guard: RunGuard) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        async move {
            let started_at = Utc::now();
            info!(feed = self.feed.location(), "sync run started");
            let result = self.execute(run_id, started_at).await;

            match &result {
                Ok(summary) => {
                    let finished_at = summary.finished_at;
                    guard.settle(|status| {
                        status.advance_progress(100);
                        status.last_run = Some(finished_at);
                        status.next_run = next_local_midnight();
                        status.last_error = None;
                    });
                    info!(
                        records = summary.total_records,
                        imported = summary.imported,
                        updated = summary.updated,
                        errors = summary.errors,
                        archived = summary.archived,
                        "sync run finished"
                    );
                }
                Err(err) => {
                    error!(error = %err, "sync run aborted");
                    let message = err.to_string();
                    guard.settle(|status| status.last_error = Some(message));
                }
            }
            result
        }
        .instrument(info_span!("sync_run", %run_id))
        .await
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncSummary, SyncError> {
        self.backend.begin_run().await;
        let records = self.feed.fetch_records().await?;
        let total = records.len();

        self.enter_phase(SyncPhase::Upserting).await;
        let counters = self.upsert_all(&records).await;

        self.enter_phase(SyncPhase::AttachingMedia).await;
        self.attach_media(&records).await;

        self.enter_phase(SyncPhase::Archiving).await;
        let current_ids: HashSet<String> = records.iter().map(|r| r.external_id.clone()).collect();
        let archived = match self.backend.archive_stale(&current_ids).await {
            Ok(archived) => archived,
            Err(err) => {
                warn!(error = %err, "archiving stale listings failed");
                0
            }
        };

        Ok(SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_records: total,
            imported: counters.imported,
            updated: counters.updated,
            errors: counters.errors,
            archived,
        })
    }

    async fn upsert_all(&self, records: &[PropertyRecord]) -> RunCounters {
        let total = records.len();
        let mut counters = RunCounters::default();
        let mut processed = 0usize;

        for batch in records.chunks(UPSERT_BATCH_SIZE) {
            for record in batch {
                match self.backend.upsert(record).await {
                    Ok(outcome) => {
                        if outcome.created {
                            counters.imported += 1;
                        } else {
                            counters.updated += 1;
                        }
                        for failure in &outcome.taxonomy_failures {
                            warn!(external_id = %record.external_id, error = %failure, "taxonomy assignment failed");
                        }
                    }
                    Err(err) => {
                        counters.errors += 1;
                        warn!(error = %err, "listing upsert failed");
                    }
                }
            }
            processed += batch.len();
            self.publish(counters, upsert_progress(processed, total)).await;
            debug!(processed, total, "upsert batch done");
        }

        if total == 0 {
            self.publish(counters, upsert_progress(0, 0)).await;
        }
        counters
    }

    async fn attach_media(&self, records: &[PropertyRecord]) {
        let total = records.len();
        for (index, record) in records.iter().enumerate() {
            if record.has_images() {
                match self.backend.find_by_external_id(&record.external_id).await {
                    Some(post) => {
                        let report = self.backend.attach_images(post.id, &record.images).await;
                        for failure in &report.failures {
                            warn!(external_id = %record.external_id, error = %failure, "image skipped");
                        }
                        debug!(
                            external_id = %record.external_id,
                            post_id = post.id,
                            attached = report.attachment_ids.len(),
                            "images attached"
                        );
                    }
                    None => {
                        warn!(external_id = %record.external_id, "no backend post for listing; images skipped")
                    }
                }
            }
            write_status(&self.status).advance_progress(media_progress(index, total));
        }
    }

    async fn enter_phase(&self, phase: SyncPhase) {
        write_status(&self.status).current_phase = phase;
        debug!(phase = phase.label(), "entering phase");
    }

    async fn publish(&self, counters: RunCounters, progress: u8) {
        let mut status = write_status(&self.status);
        status.total_imported = counters.imported;
        status.total_updated = counters.updated;
        status.total_errors = counters.errors;
        status.advance_progress(progress);
    }
}

/// Runs the orchestrator once a day at local midnight and exposes
/// on-demand runs.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            task: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Start the daily loop. No-op while it is already scheduled.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("scheduler already started");
            return;
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        *task = Some(tokio::spawn(
            daily_loop(orchestrator).instrument(info_span!("scheduler")),
        ));
        info!("scheduler started");
    }

    /// Cancel the daily loop. A run already in flight is left to finish.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("scheduler stopped");
        }
    }

    pub async fn is_scheduled(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start a background run and return the status right after it began.
    pub async fn run_now(&self) -> Result<SyncStatus, SyncError> {
        let guard = self.orchestrator.begin().await?;
        let snapshot = self.orchestrator.status().await;
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            // The outcome is recorded in the shared status.
            let _ = orchestrator.run_detached(guard).await;
        });
        Ok(snapshot)
    }

    pub async fn status(&self) -> SyncStatus {
        self.orchestrator.status().await
    }

    pub async fn schedule(&self) -> ScheduleSnapshot {
        self.orchestrator.status().await.schedule()
    }

    pub async fn next_run(&self) -> DateTime<Utc> {
        self.orchestrator.status().await.next_run
    }
}

async fn daily_loop(orchestrator: Arc<SyncOrchestrator>) {
    loop {
        let next_run = next_local_midnight();
        orchestrator.set_next_run(next_run).await;
        info!(%next_run, "next scheduled sync");

        let wait = (next_run - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match orchestrator.begin().await {
            // Detached so stopping the scheduler never cuts a run short.
            Ok(guard) => {
                if let Err(err) = orchestrator.run_detached(guard).await {
                    warn!(error = %err, "scheduled sync did not complete");
                }
            }
            Err(err) => warn!(error = %err, "scheduled sync skipped"),
        }
    }
}
