//! One worker: transfer a single asset to disk and record the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::{SchedulerError, SchedulerEvent};
use crate::config::MirrorConfig;
use crate::download::filename::partial_path;
use crate::download::{FetchError, FetchOutcome, Fetcher};
use crate::ledger::{LedgerEntry, LedgerHandle};
use crate::model::{DownloadOutcome, DownloadResult, DownloadTask, SkipReason};

/// Shared by every worker of one run.
pub(super) struct WorkerContext {
    pub(super) config: Arc<MirrorConfig>,
    pub(super) fetcher: Fetcher,
    pub(super) ledger: LedgerHandle,
    pub(super) events: mpsc::Sender<SchedulerEvent>,
}

/// How a worker ended.
#[derive(Debug)]
pub(super) enum TaskExit {
    /// A result was recorded and emitted.
    Done,
    /// Stopped by the cancel flag; the entry stays Pending.
    Interrupted,
    /// The disk filled up; the entry stays Pending and the run must stop.
    StorageFull(PathBuf),
    /// The ledger could not record the outcome.
    Ledger(SchedulerError),
}

impl WorkerContext {
    async fn emit(&self, result: DownloadResult) {
        let _ = self.events.send(SchedulerEvent::Asset(result)).await;
    }

    async fn record(&self, entry: LedgerEntry) -> Result<(), TaskExit> {
        match self.ledger.upsert(entry).await.map_err(SchedulerError::from) {
            Ok(()) => Ok(()),
            Err(SchedulerError::StorageFull { path }) => {
                warn!(path = %path.display(), "disk full while recording outcome; stopping run");
                self.fetcher.interrupt();
                self.fetcher.live().add_abandoned(1);
                Err(TaskExit::StorageFull(path))
            }
            Err(e) => Err(TaskExit::Ledger(e)),
        }
    }
}

/// Runs one task to a terminal state.
#[instrument(skip(ctx, task), fields(post_id = %task.asset.post_id, url = %task.asset.asset_url))]
pub(super) async fn run_task(ctx: Arc<WorkerContext>, task: DownloadTask) -> TaskExit {
    match execute(&ctx, task).await {
        Ok(exit) | Err(exit) => exit,
    }
}

async fn execute(ctx: &WorkerContext, task: DownloadTask) -> Result<TaskExit, TaskExit> {
    let entry = LedgerEntry::pending(&task.asset, &task.file_name);

    if task.reverify {
        if let Some(bytes) = reverify(ctx, &task).await {
            ctx.record(entry.into_complete(bytes, task.attempts)).await?;
            ctx.emit(DownloadResult {
                asset: task.asset,
                outcome: DownloadOutcome::Skipped(SkipReason::Reverified),
            })
            .await;
            return Ok(TaskExit::Done);
        }
    }

    if let Some(dir) = task.target_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            let error = FetchError::io(dir, e);
            return fail(ctx, task, entry, error, 0).await;
        }
    }

    let part = partial_path(&task.target_path);
    let filter = ctx.config.asset_type_filter;
    let accept = move |content_type: Option<&str>| filter.admits_content_type(content_type);
    let transport = Arc::clone(ctx.fetcher.transport());
    let timeout = ctx.fetcher.timeout();
    let url = task.asset.asset_url.clone();

    let outcome = ctx
        .fetcher
        .retrying(&url, |attempt| {
            let transport = Arc::clone(&transport);
            let url = url.clone();
            let part = part.clone();
            async move {
                debug!(attempt, "transferring asset");
                let transfer = transport
                    .fetch_to_file(&url, timeout, &part, &accept)
                    .await?;
                match transfer.content_length {
                    Some(expected) if expected != transfer.bytes_written => {
                        let _ = tokio::fs::remove_file(&part).await;
                        Err(FetchError::truncated(
                            url,
                            expected,
                            transfer.bytes_written,
                        ))
                    }
                    _ => Ok(transfer),
                }
            }
        })
        .await;

    match outcome {
        FetchOutcome::Fetched { value, attempts } => {
            if let Err(e) = tokio::fs::rename(&part, &task.target_path).await {
                let error = FetchError::io(&task.target_path, e);
                return fail(ctx, task, entry, error, attempts).await;
            }
            ctx.record(entry.into_complete(value.bytes_written, task.attempts + attempts))
                .await?;
            info!(
                path = %task.target_path.display(),
                bytes = value.bytes_written,
                attempts,
                "asset downloaded"
            );
            ctx.emit(DownloadResult {
                asset: task.asset,
                outcome: DownloadOutcome::Success {
                    bytes_written: value.bytes_written,
                },
            })
            .await;
            Ok(TaskExit::Done)
        }
        FetchOutcome::Failed {
            error, attempts, ..
        } => fail(ctx, task, entry, error, attempts).await,
        FetchOutcome::Interrupted { .. } => {
            let _ = tokio::fs::remove_file(&part).await;
            ctx.fetcher.live().add_abandoned(1);
            debug!("asset left pending by interrupt");
            Ok(TaskExit::Interrupted)
        }
    }
}

/// Probes the server size of an asset already on disk. Returns the size when
/// it matches the local file.
async fn reverify(ctx: &WorkerContext, task: &DownloadTask) -> Option<u64> {
    let local = tokio::fs::metadata(&task.target_path).await.ok()?.len();
    match ctx.fetcher.probe_length(&task.asset.asset_url).await {
        Ok(Some(remote)) if remote == local => {
            debug!(bytes = local, "existing file matches server size");
            Some(local)
        }
        Ok(remote) => {
            debug!(local, ?remote, "existing file does not match; downloading again");
            None
        }
        Err(e) => {
            debug!(error = %e, "size probe failed; downloading again");
            None
        }
    }
}

/// Records a failed asset. `attempts` counts this run only; the ledger keeps
/// the total across runs.
async fn fail(
    ctx: &WorkerContext,
    task: DownloadTask,
    entry: LedgerEntry,
    error: FetchError,
    attempts: u32,
) -> Result<TaskExit, TaskExit> {
    if error.is_storage_full() {
        warn!(path = %task.target_path.display(), "disk full; stopping run");
        ctx.fetcher.interrupt();
        ctx.fetcher.live().add_abandoned(1);
        return Ok(TaskExit::StorageFull(task.target_path));
    }

    let attempts = attempts.max(1);
    warn!(attempts, error = %error, "asset failed");
    ctx.record(entry.into_failed(task.attempts + attempts, error.to_string()))
        .await?;
    ctx.emit(DownloadResult {
        asset: task.asset,
        outcome: DownloadOutcome::Failed {
            kind: error.kind(),
            attempts,
            message: error.to_string(),
        },
    })
    .await;
    Ok(TaskExit::Done)
}
