//! The single task that owns `.ledger`, `.ledger.journal` and `.progress`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::progress::{PageTracker, ProgressState};
use super::store::{Journal, write_atomic};
use super::{
    JOURNAL_FILE, LEDGER_FILE, LedgerEntry, LedgerError, LoadedLedger, PROGRESS_FILE,
    encode_snapshot, redrive_entries,
};
use crate::model::AssetKey;

/// Command queue depth.
const COMMAND_BUFFER: usize = 256;

type Ack = oneshot::Sender<Result<(), LedgerError>>;

enum LedgerCommand {
    Upsert { entry: LedgerEntry, ack: Ack },
    Get {
        key: AssetKey,
        reply: oneshot::Sender<Option<LedgerEntry>>,
    },
    Redrive {
        retry_failed: bool,
        reply: oneshot::Sender<Vec<LedgerEntry>>,
    },
    PostExpanded {
        offset: u64,
        assets: usize,
        counted: bool,
    },
    PageComplete {
        offset: u64,
        next_offset: u64,
        posts: usize,
    },
    Progress {
        reply: oneshot::Sender<ProgressState>,
    },
    Snapshot { ack: Ack },
    Shutdown { ack: Ack },
}

/// Cloneable handle to the ledger writer task.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerCommand>,
}

impl std::fmt::Debug for LedgerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Upsert { .. } => "Upsert",
            Self::Get { .. } => "Get",
            Self::Redrive { .. } => "Redrive",
            Self::PostExpanded { .. } => "PostExpanded",
            Self::PageComplete { .. } => "PageComplete",
            Self::Progress { .. } => "Progress",
            Self::Snapshot { .. } => "Snapshot",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl LedgerHandle {
    async fn send(&self, command: LedgerCommand) -> Result<(), LedgerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| LedgerError::WriterClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LedgerCommand,
    ) -> Result<T, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| LedgerError::WriterClosed)
    }

    /// Inserts or replaces an entry. Terminal entries are on disk when this
    /// returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the journal write error, or [`LedgerError::WriterClosed`].
    pub async fn upsert(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.request(|ack| LedgerCommand::Upsert { entry, ack })
            .await?
    }

    /// Looks up an entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterClosed`] if the writer is gone.
    pub async fn get(&self, key: AssetKey) -> Result<Option<LedgerEntry>, LedgerError> {
        self.request(|reply| LedgerCommand::Get { key, reply })
            .await
    }

    /// Entries a resumed run should attempt again.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterClosed`] if the writer is gone.
    pub async fn redrive(&self, retry_failed: bool) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.request(|reply| LedgerCommand::Redrive {
            retry_failed,
            reply,
        })
        .await
    }

    /// Reports that a post from the page at `offset` was expanded into
    /// `assets` assets. Uncounted expansions (transient failures) keep the
    /// page open so a resume revisits it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterClosed`] if the writer is gone.
    pub async fn post_expanded(
        &self,
        offset: u64,
        assets: usize,
        counted: bool,
    ) -> Result<(), LedgerError> {
        self.send(LedgerCommand::PostExpanded {
            offset,
            assets,
            counted,
        })
        .await
    }

    /// Reports that the walker handed out all `posts` posts of the page at
    /// `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterClosed`] if the writer is gone.
    pub async fn page_complete(
        &self,
        offset: u64,
        next_offset: u64,
        posts: usize,
    ) -> Result<(), LedgerError> {
        self.send(LedgerCommand::PageComplete {
            offset,
            next_offset,
            posts,
        })
        .await
    }

    /// Current progress state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterClosed`] if the writer is gone.
    pub async fn progress(&self) -> Result<ProgressState, LedgerError> {
        self.request(|reply| LedgerCommand::Progress { reply })
            .await
    }

    /// Forces a snapshot and journal truncation.
    ///
    /// # Errors
    ///
    /// Returns the snapshot write error, or [`LedgerError::WriterClosed`].
    pub async fn snapshot(&self) -> Result<(), LedgerError> {
        self.request(|ack| LedgerCommand::Snapshot { ack }).await?
    }

    /// Writes a final snapshot and stops the writer.
    ///
    /// # Errors
    ///
    /// Returns the snapshot write error, or [`LedgerError::WriterClosed`].
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        self.request(|ack| LedgerCommand::Shutdown { ack }).await?
    }
}

struct LedgerWriter {
    user_dir: PathBuf,
    entries: BTreeMap<AssetKey, LedgerEntry>,
    progress: ProgressState,
    tracker: PageTracker,
    journal: Journal,
    snapshot_every: usize,
    updates_since_snapshot: usize,
}

/// Starts the writer task for `user_dir`, seeded with `loaded` entries and
/// the given starting `progress`.
///
/// The user directory is created if missing. If a previous run recovered from
/// a corrupt snapshot, a clean snapshot is written right away.
///
/// # Errors
///
/// Returns [`LedgerError::Io`] if the directory cannot be created or the
/// initial snapshot cannot be written.
#[instrument(skip_all, fields(user_dir = %user_dir.display()))]
pub async fn spawn_writer(
    user_dir: PathBuf,
    loaded: LoadedLedger,
    progress: ProgressState,
    snapshot_every: usize,
) -> Result<(LedgerHandle, JoinHandle<()>), LedgerError> {
    tokio::fs::create_dir_all(&user_dir)
        .await
        .map_err(|e| LedgerError::io(&user_dir, e))?;

    let mut writer = LedgerWriter {
        journal: Journal::new(user_dir.join(JOURNAL_FILE)),
        user_dir,
        entries: loaded.entries,
        progress,
        tracker: PageTracker::new(),
        snapshot_every: snapshot_every.max(1),
        updates_since_snapshot: 0,
    };

    // Reconciled state (downgrades, dropped corrupt snapshot) becomes the
    // new baseline before anything else is journaled.
    writer.write_snapshot().await?;
    writer.write_progress().await?;

    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = tokio::spawn(writer.run(rx));
    Ok((LedgerHandle { tx }, handle))
}

impl LedgerWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<LedgerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LedgerCommand::Upsert { entry, ack } => {
                    let result = self.upsert(entry).await;
                    let _ = ack.send(result);
                }
                LedgerCommand::Get { key, reply } => {
                    let _ = reply.send(self.entries.get(&key).cloned());
                }
                LedgerCommand::Redrive {
                    retry_failed,
                    reply,
                } => {
                    let _ = reply.send(redrive_entries(&self.entries, retry_failed));
                }
                LedgerCommand::PostExpanded {
                    offset,
                    assets,
                    counted,
                } => {
                    self.progress.total_assets_seen += assets as u64;
                    if counted {
                        self.tracker.post_expanded(offset);
                    }
                    self.advance_progress().await;
                }
                LedgerCommand::PageComplete {
                    offset,
                    next_offset,
                    posts,
                } => {
                    self.tracker.page_complete(offset, next_offset, posts);
                    self.advance_progress().await;
                }
                LedgerCommand::Progress { reply } => {
                    let _ = reply.send(self.progress.clone());
                }
                LedgerCommand::Snapshot { ack } => {
                    let result = self.write_snapshot().await;
                    let _ = ack.send(result);
                }
                LedgerCommand::Shutdown { ack } => {
                    let result = self.finish().await;
                    let _ = ack.send(result);
                    return;
                }
            }
        }

        // Every handle dropped without an explicit shutdown.
        if let Err(e) = self.finish().await {
            error!(error = %e, "final ledger snapshot failed");
        }
    }

    async fn upsert(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let sync = entry.status.is_terminal();
        self.journal.append(&entry, sync).await?;
        self.entries.insert(entry.key(), entry);

        self.updates_since_snapshot += 1;
        if self.updates_since_snapshot >= self.snapshot_every {
            // A failed compaction leaves the journal intact; the upsert
            // itself is already durable.
            if let Err(e) = self.write_snapshot().await {
                warn!(error = %e, "periodic ledger snapshot failed");
            }
        }
        Ok(())
    }

    async fn advance_progress(&mut self) {
        if self.tracker.advance(&mut self.progress) {
            debug!(
                next_offset = self.progress.next_offset,
                "crawl progress advanced"
            );
        }
        // Totals change on every expansion, so persist regardless.
        if let Err(e) = self.write_progress().await {
            warn!(error = %e, "progress write failed");
        }
    }

    async fn write_snapshot(&mut self) -> Result<(), LedgerError> {
        let path = self.user_dir.join(LEDGER_FILE);
        let bytes = encode_snapshot(&self.entries, &path)?;
        write_atomic(&path, &bytes).await?;
        self.journal.truncate().await?;
        self.updates_since_snapshot = 0;
        debug!(entries = self.entries.len(), "ledger snapshot written");
        Ok(())
    }

    async fn write_progress(&self) -> Result<(), LedgerError> {
        let path = self.user_dir.join(PROGRESS_FILE);
        let bytes =
            serde_json::to_vec_pretty(&self.progress).map_err(|e| LedgerError::encode(&path, e))?;
        write_atomic(&path, &bytes).await
    }

    async fn finish(&mut self) -> Result<(), LedgerError> {
        self.write_progress().await?;
        self.write_snapshot().await?;
        info!(
            entries = self.entries.len(),
            next_offset = self.progress.next_offset,
            "ledger flushed"
        );
        Ok(())
    }
}
