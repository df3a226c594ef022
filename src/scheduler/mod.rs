//! Bounded-concurrency download scheduler.
//!
//! The scheduler consumes [`WalkEvent`]s, expands each post into assets,
//! deduplicates them against the run and the ledger, and runs one worker per
//! admitted asset on a [`JoinSet`]. A semaphore of `max_concurrent_downloads`
//! slots bounds the pool; admission blocks until a slot frees.
//!
//! # Concurrency Model
//!
//! - Each transfer runs in its own Tokio task
//! - A slot is acquired before spawning (RAII permit moved into the task)
//! - Every network attempt additionally holds a [`RateLimiter`] permit
//! - Workers write the ledger before emitting their result
//!
//! [`RateLimiter`]: crate::download::RateLimiter

mod task;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

use self::task::{TaskExit, WorkerContext, run_task};
use crate::config::MirrorConfig;
use crate::download::constants::INTERRUPT_POLL_INTERVAL;
use crate::download::filename::{fallback_name, plan_post_file_names_around};
use crate::download::{FetchOutcome, Fetcher};
use crate::extract::ExtractionAdapter;
use crate::ledger::{LedgerEntry, LedgerError, LedgerHandle, LedgerStatus};
use crate::model::{
    Asset, AssetKey, DownloadOutcome, DownloadResult, DownloadTask, FailureKind, Post, SkipReason,
    post_dir_name,
};
use crate::walker::{WalkEnd, WalkEvent};

/// Errors that stop the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The ledger could not record an admission or outcome.
    #[error("ledger unavailable: {0}")]
    Ledger(#[source] LedgerError),

    /// The disk filled up during a transfer.
    #[error("disk full while writing {}", path.display())]
    StorageFull {
        /// File being written.
        path: PathBuf,
    },

    /// The worker pool semaphore was closed.
    #[error("worker pool closed unexpectedly")]
    PoolClosed,
}

/// A ledger write that failed because the disk is full stops the run the
/// same way a full disk during a transfer does.
impl From<LedgerError> for SchedulerError {
    fn from(error: LedgerError) -> Self {
        if let Some(path) = error.storage_full_path().map(Path::to_path_buf) {
            return Self::StorageFull { path };
        }
        Self::Ledger(error)
    }
}

/// Post-level and asset-level events, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A post was expanded and its assets recorded.
    PostExpanded {
        /// Post identifier.
        post_id: String,
        /// Assets found on the post.
        assets: usize,
    },
    /// A post page could not be fetched or parsed.
    PostFailed {
        /// Post identifier.
        post_id: String,
        /// Classified failure.
        kind: FailureKind,
        /// Error message.
        message: String,
    },
    /// Terminal result for one asset.
    Asset(DownloadResult),
}

/// What the scheduler saw of its input.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    /// How the walk ended, when the input came from a walker.
    pub walk_end: Option<WalkEnd>,
    /// True if the run was cut short by the cancel flag.
    pub interrupted: bool,
}

/// Expands posts and runs asset transfers.
pub struct DownloadScheduler {
    config: Arc<MirrorConfig>,
    fetcher: Fetcher,
    adapter: Arc<dyn ExtractionAdapter>,
    ledger: LedgerHandle,
    user_dir: PathBuf,
    track_progress: bool,
}

/// Per-run admission state.
struct Admission {
    admitted: HashSet<AssetKey>,
    slots: Arc<Semaphore>,
    workers: JoinSet<TaskExit>,
    storage_full: Option<PathBuf>,
    fatal: Option<SchedulerError>,
}

enum PostExpansion {
    Expanded(Vec<Asset>),
    /// Failed; `counted` is true when retrying later cannot help.
    Failed { counted: bool },
    Interrupted,
}

impl DownloadScheduler {
    /// Creates a scheduler writing into `user_dir`.
    #[must_use]
    pub fn new(
        config: Arc<MirrorConfig>,
        fetcher: Fetcher,
        adapter: Arc<dyn ExtractionAdapter>,
        ledger: LedgerHandle,
        user_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            fetcher,
            adapter,
            ledger,
            user_dir,
            track_progress: true,
        }
    }

    /// Stops the scheduler from reporting expansions to the crawl progress
    /// tracker. Used when posts do not come from a catalog walk.
    #[must_use]
    pub fn without_progress(mut self) -> Self {
        self.track_progress = false;
        self
    }

    /// Runs `redrive` entries first, then every post of `input`, and waits for
    /// all transfers.
    ///
    /// Events are sent on `events` as they happen; a dropped receiver is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::StorageFull`] if the disk filled up, or
    /// [`SchedulerError::Ledger`] if the ledger stopped accepting writes. In
    /// both cases in-flight work is drained first.
    #[instrument(skip_all, fields(user_dir = %self.user_dir.display()))]
    pub async fn run<S>(
        &self,
        redrive: Vec<LedgerEntry>,
        input: S,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Result<SchedulerReport, SchedulerError>
    where
        S: Stream<Item = WalkEvent> + Send,
    {
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            fetcher: self.fetcher.clone(),
            ledger: self.ledger.clone(),
            events: events.clone(),
        });
        let mut admission = Admission {
            admitted: HashSet::new(),
            slots: Arc::new(Semaphore::new(self.config.max_concurrent_downloads)),
            workers: JoinSet::new(),
            storage_full: None,
            fatal: None,
        };
        let mut report = SchedulerReport::default();

        info!(
            concurrency = self.config.max_concurrent_downloads,
            redrive = redrive.len(),
            "scheduler starting"
        );

        let result = self
            .feed(&ctx, &mut admission, &mut report, redrive, input, &events)
            .await;
        if let Err(e) = result {
            admission.fatal.get_or_insert(e);
        }
        if admission.fatal.is_some() {
            self.fetcher.interrupt();
        }

        self.drain(&mut admission).await;
        report.interrupted = self.fetcher.is_interrupted();

        if let Some(e) = admission.fatal {
            return Err(e);
        }
        if let Some(path) = admission.storage_full {
            return Err(SchedulerError::StorageFull { path });
        }
        Ok(report)
    }

    async fn feed<S>(
        &self,
        ctx: &Arc<WorkerContext>,
        admission: &mut Admission,
        report: &mut SchedulerReport,
        redrive: Vec<LedgerEntry>,
        input: S,
        events: &mpsc::Sender<SchedulerEvent>,
    ) -> Result<(), SchedulerError>
    where
        S: Stream<Item = WalkEvent> + Send,
    {
        for entry in redrive {
            if self.should_stop(admission) {
                return Ok(());
            }
            let asset = entry.to_asset();
            let name = entry
                .file_name
                .clone()
                .unwrap_or_else(|| fallback_name(&asset));
            if let Some(task) = self.admit(admission, asset, name, events).await? {
                self.spawn(ctx, admission, task).await?;
            }
        }

        let mut input = std::pin::pin!(input);
        while !self.should_stop(admission) {
            let Some(event) = input.next().await else {
                break;
            };
            match event {
                WalkEvent::Post(post) => {
                    self.fetcher.live().add_post_discovered();
                    self.process_post(ctx, admission, post, events).await?;
                }
                WalkEvent::PageComplete {
                    offset,
                    next_offset,
                    posts,
                } => {
                    if self.track_progress {
                        self.ledger.page_complete(offset, next_offset, posts).await?;
                    }
                }
                WalkEvent::Finished(end) => {
                    report.walk_end = Some(end);
                }
            }
        }
        Ok(())
    }

    fn should_stop(&self, admission: &mut Admission) -> bool {
        reap(admission);
        self.fetcher.is_interrupted()
            || admission.storage_full.is_some()
            || admission.fatal.is_some()
    }

    #[instrument(skip_all, fields(post_id = %post.post_id))]
    async fn process_post(
        &self,
        ctx: &Arc<WorkerContext>,
        admission: &mut Admission,
        post: Post,
        events: &mpsc::Sender<SchedulerEvent>,
    ) -> Result<(), SchedulerError> {
        if !self.config.accepts_post(&post.post_id) {
            debug!("post outside filter; passing over");
            return self.post_done(&post, 0, true).await;
        }

        let assets = match self.expand(&post, events).await {
            PostExpansion::Expanded(assets) => assets,
            PostExpansion::Failed { counted } => {
                return self.post_done(&post, 0, counted).await;
            }
            PostExpansion::Interrupted => return Ok(()),
        };

        // Names already in the ledger stay put; new assets are named around them.
        let mut recorded = Vec::with_capacity(assets.len());
        for asset in &assets {
            let entry = self.ledger.get(asset.key()).await?;
            recorded.push(entry.and_then(|entry| entry.file_name));
        }
        let names = plan_post_file_names_around(&assets, &recorded);
        let mut tasks = Vec::with_capacity(assets.len());
        for (asset, name) in assets.iter().cloned().zip(names) {
            if let Some(task) = self.admit(admission, asset, name, events).await? {
                tasks.push(task);
            }
        }

        // Every asset is now Pending or terminal in the ledger.
        self.post_done(&post, assets.len(), true).await?;
        self.fetcher.live().add_post_processed();
        let _ = events
            .send(SchedulerEvent::PostExpanded {
                post_id: post.post_id.clone(),
                assets: assets.len(),
            })
            .await;

        for task in tasks {
            if self.should_stop(admission) {
                debug!("stopping admission; remaining assets stay pending");
                break;
            }
            self.spawn(ctx, admission, task).await?;
        }
        Ok(())
    }

    async fn post_done(&self, post: &Post, assets: usize, counted: bool) -> Result<(), SchedulerError> {
        if self.track_progress {
            self.ledger
                .post_expanded(post.discovered_at_offset, assets, counted)
                .await?;
        }
        Ok(())
    }

    async fn expand(&self, post: &Post, events: &mpsc::Sender<SchedulerEvent>) -> PostExpansion {
        let (kind, message, counted) = match self.fetcher.fetch(&post.source_url).await {
            FetchOutcome::Fetched { value, .. } => {
                match self.adapter.extract_assets(post, &value.bytes) {
                    Ok(assets) => {
                        debug!(assets = assets.len(), "post expanded");
                        return PostExpansion::Expanded(assets);
                    }
                    Err(e) => (FailureKind::Extraction, e.to_string(), true),
                }
            }
            FetchOutcome::Failed {
                error,
                state,
                attempts,
            } => {
                let counted = state == crate::download::TaskState::PermanentFail;
                debug!(attempts, counted, "post fetch failed");
                (error.kind(), error.to_string(), counted)
            }
            FetchOutcome::Interrupted { .. } => return PostExpansion::Interrupted,
        };

        warn!(post_id = %post.post_id, kind = %kind, error = %message, "post failed");
        let _ = events
            .send(SchedulerEvent::PostFailed {
                post_id: post.post_id.clone(),
                kind,
                message,
            })
            .await;
        PostExpansion::Failed { counted }
    }

    /// Dedups, filters and consults the ledger. Returns a task when the asset
    /// needs a transfer; otherwise emits the skip.
    async fn admit(
        &self,
        admission: &mut Admission,
        asset: Asset,
        planned_name: String,
        events: &mpsc::Sender<SchedulerEvent>,
    ) -> Result<Option<DownloadTask>, SchedulerError> {
        if !admission.admitted.insert(asset.key()) {
            return Ok(None);
        }

        let filter = self.config.asset_type_filter;
        if !filter.admits_url(&asset.asset_url, asset.suggested_name.as_deref()) {
            debug!(url = %asset.asset_url, %filter, "asset filtered out");
            emit_skip(events, asset, SkipReason::FilteredOut).await;
            return Ok(None);
        }

        let existing = self.ledger.get(asset.key()).await?;
        let file_name = existing
            .as_ref()
            .and_then(|entry| entry.file_name.clone())
            .unwrap_or(planned_name);
        let target_path = self.target_path(&asset.post_id, &file_name);
        let on_disk = file_len(&target_path).await.filter(|len| *len > 0);

        if self.config.skip_existing
            && on_disk.is_some()
            && existing
                .as_ref()
                .is_some_and(|entry| entry.status == LedgerStatus::Complete)
        {
            debug!(path = %target_path.display(), "already complete");
            emit_skip(events, asset, SkipReason::AlreadyComplete).await;
            return Ok(None);
        }

        let attempts = existing.as_ref().map_or(0, |entry| entry.attempts);
        let mut pending = LedgerEntry::pending(&asset, &file_name);
        pending.attempts = attempts;
        self.ledger.upsert(pending).await?;

        Ok(Some(DownloadTask {
            asset,
            file_name,
            target_path,
            attempts,
            reverify: self.config.skip_existing && on_disk.is_some(),
        }))
    }

    fn target_path(&self, post_id: &str, file_name: &str) -> PathBuf {
        self.user_dir.join(post_dir_name(post_id)).join(file_name)
    }

    async fn spawn(
        &self,
        ctx: &Arc<WorkerContext>,
        admission: &mut Admission,
        task: DownloadTask,
    ) -> Result<(), SchedulerError> {
        let Some(permit) = self.acquire_slot(admission).await? else {
            return Ok(());
        };
        self.fetcher.live().add_asset_attempted();
        let ctx = Arc::clone(ctx);
        admission.workers.spawn(async move {
            let _permit = permit;
            run_task(ctx, task).await
        });
        Ok(())
    }

    /// Waits for a pool slot, giving up when the run is stopping.
    async fn acquire_slot(
        &self,
        admission: &mut Admission,
    ) -> Result<Option<OwnedSemaphorePermit>, SchedulerError> {
        loop {
            if self.should_stop(admission) {
                return Ok(None);
            }
            tokio::select! {
                biased;
                permit = Arc::clone(&admission.slots).acquire_owned() => {
                    return permit.map(Some).map_err(|_| SchedulerError::PoolClosed);
                }
                () = tokio::time::sleep(INTERRUPT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Waits for workers. Once the run is interrupted, workers get
    /// `shutdown_grace` to finish and are then aborted.
    async fn drain(&self, admission: &mut Admission) {
        let mut deadline = None;
        loop {
            if deadline.is_none() && self.fetcher.is_interrupted() {
                debug!(
                    in_flight = admission.workers.len(),
                    grace_ms = self.config.shutdown_grace.as_millis(),
                    "waiting for in-flight transfers"
                );
                deadline = Some(Box::pin(tokio::time::sleep(self.config.shutdown_grace)));
            }

            let joined = match deadline.as_mut() {
                Some(deadline) => tokio::select! {
                    biased;
                    joined = admission.workers.join_next() => joined,
                    () = deadline => {
                        let abandoned = admission.workers.len();
                        if abandoned > 0 {
                            warn!(abandoned, "aborting transfers after shutdown grace");
                            self.fetcher.live().add_abandoned(abandoned as u64);
                        }
                        admission.workers.abort_all();
                        while admission.workers.join_next().await.is_some() {}
                        return;
                    }
                },
                None => tokio::select! {
                    biased;
                    joined = admission.workers.join_next() => joined,
                    () = tokio::time::sleep(INTERRUPT_POLL_INTERVAL) => continue,
                },
            };

            match joined {
                Some(result) => handle_exit(admission, result),
                None => return,
            }
        }
    }
}

fn reap(admission: &mut Admission) {
    while let Some(result) = admission.workers.try_join_next() {
        handle_exit(admission, result);
    }
}

fn handle_exit(admission: &mut Admission, result: Result<TaskExit, JoinError>) {
    match result {
        Ok(TaskExit::Done | TaskExit::Interrupted) => {}
        Ok(TaskExit::StorageFull(path)) => {
            admission.storage_full.get_or_insert(path);
        }
        Ok(TaskExit::Ledger(e)) => {
            admission.fatal.get_or_insert(e);
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(error = %e, "download task panicked"),
    }
}

async fn emit_skip(events: &mpsc::Sender<SchedulerEvent>, asset: Asset, reason: SkipReason) {
    let _ = events
        .send(SchedulerEvent::Asset(DownloadResult {
            asset,
            outcome: DownloadOutcome::Skipped(reason),
        }))
        .await;
}

async fn file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}
