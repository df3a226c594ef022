//! Persistent per-asset completion state for one user directory.
//!
//! On disk the ledger is three files inside `user_{id}/`:
//!
//! - `.ledger`: JSON snapshot `{"version": 1, "entries": [...]}`
//! - `.ledger.journal`: JSON lines, one upserted entry per line, appended
//!   since the last snapshot
//! - `.progress`: the [`ProgressState`] used to resume the crawl
//!
//! [`Ledger::load`] reconciles these with the files actually present. After
//! that, a single writer task ([`spawn_writer`]) owns all three files; every
//! other component talks to it through a cloneable [`LedgerHandle`].

mod progress;
mod store;
mod writer;

pub use progress::{PageTracker, ProgressState};
pub use writer::{LedgerHandle, spawn_writer};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Asset, AssetKey, post_dir_name};

/// Snapshot file name inside the user directory.
pub const LEDGER_FILE: &str = ".ledger";
/// Journal file name inside the user directory.
pub const JOURNAL_FILE: &str = ".ledger.journal";
/// Progress file name inside the user directory.
pub const PROGRESS_FILE: &str = ".progress";

/// Snapshot format version written by this build.
const SNAPSHOT_VERSION: u32 = 1;

/// Completion status of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Admitted but not (verifiably) finished.
    Pending,
    /// File written and size-verified.
    Complete,
    /// Gave up after a permanent failure or exhausted retries.
    Failed,
}

impl LedgerStatus {
    /// Returns the serialized representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Complete` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One asset's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning post.
    pub post_id: String,
    /// Absolute asset URL.
    pub asset_url: String,
    /// Current status.
    pub status: LedgerStatus,
    /// When the status last changed.
    pub last_attempt_at: DateTime<Utc>,
    /// 1-based position within the post.
    #[serde(default)]
    pub ordinal: u32,
    /// Name offered by the source.
    #[serde(default)]
    pub suggested_name: Option<String>,
    /// File name chosen inside the post folder.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Verified size when `Complete`.
    #[serde(default)]
    pub bytes: Option<u64>,
    /// Attempts made across runs.
    #[serde(default)]
    pub attempts: u32,
    /// Last error message when `Failed`.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LedgerEntry {
    /// A fresh `Pending` record for `asset` stored as `file_name`.
    #[must_use]
    pub fn pending(asset: &Asset, file_name: &str) -> Self {
        Self {
            post_id: asset.post_id.clone(),
            asset_url: asset.asset_url.clone(),
            status: LedgerStatus::Pending,
            last_attempt_at: Utc::now(),
            ordinal: asset.ordinal,
            suggested_name: asset.suggested_name.clone(),
            file_name: Some(file_name.to_string()),
            bytes: None,
            attempts: 0,
            last_error: None,
        }
    }

    /// Marks the entry complete with a verified size.
    #[must_use]
    pub fn into_complete(mut self, bytes: u64, attempts: u32) -> Self {
        self.status = LedgerStatus::Complete;
        self.bytes = Some(bytes);
        self.attempts = attempts;
        self.last_error = None;
        self.last_attempt_at = Utc::now();
        self
    }

    /// Marks the entry failed.
    #[must_use]
    pub fn into_failed(mut self, attempts: u32, error: impl Into<String>) -> Self {
        self.status = LedgerStatus::Failed;
        self.bytes = None;
        self.attempts = attempts;
        self.last_error = Some(error.into());
        self.last_attempt_at = Utc::now();
        self
    }

    /// Identity of the entry.
    #[must_use]
    pub fn key(&self) -> AssetKey {
        AssetKey::new(&self.post_id, &self.asset_url)
    }

    /// Rebuilds the asset this entry describes.
    #[must_use]
    pub fn to_asset(&self) -> Asset {
        Asset {
            asset_url: self.asset_url.clone(),
            post_id: self.post_id.clone(),
            ordinal: self.ordinal,
            suggested_name: self.suggested_name.clone(),
        }
    }

    /// Where the entry's file lives under `user_dir`, if a name was chosen.
    #[must_use]
    pub fn file_path(&self, user_dir: &Path) -> Option<PathBuf> {
        self.file_name
            .as_ref()
            .map(|name| user_dir.join(post_dir_name(&self.post_id)).join(name))
    }
}

/// Errors raised while reading or writing ledger files.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure.
    #[error("ledger IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization failure.
    #[error("ledger encoding error at {path}: {source}")]
    Encode {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The writer task is gone.
    #[error("ledger writer stopped")]
    WriterClosed,
}

impl LedgerError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an encoding error.
    pub fn encode(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Encode {
            path: path.into(),
            source,
        }
    }

    /// The file being written when the disk filled up, if that is what
    /// happened.
    #[must_use]
    pub fn storage_full_path(&self) -> Option<&Path> {
        match self {
            Self::Io { path, source }
                if source.kind() == std::io::ErrorKind::StorageFull
                    || source.raw_os_error() == Some(28) =>
            {
                Some(path)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: Vec<&'a LedgerEntry>,
}

#[derive(Debug, Deserialize)]
struct SnapshotOwned {
    #[allow(dead_code)]
    version: u32,
    entries: Vec<LedgerEntry>,
}

/// State recovered from a user directory.
#[derive(Debug, Default)]
pub struct LoadedLedger {
    /// Entries keyed by asset identity.
    pub entries: BTreeMap<AssetKey, LedgerEntry>,
    /// Crawl progress from the previous run.
    pub progress: ProgressState,
    /// The snapshot was unreadable; existing files must be re-verified.
    pub recovered_from_corruption: bool,
    /// Complete entries demoted to Pending because their file was missing or
    /// the wrong size.
    pub downgraded: usize,
    /// Journal lines that could not be parsed.
    pub journal_lines_skipped: usize,
}

impl LoadedLedger {
    /// Entries a resumed run should attempt again: `Pending`, plus `Failed`
    /// when `retry_failed`.
    #[must_use]
    pub fn redrive(&self, retry_failed: bool) -> Vec<LedgerEntry> {
        redrive_entries(&self.entries, retry_failed)
    }
}

pub(crate) fn redrive_entries(
    entries: &BTreeMap<AssetKey, LedgerEntry>,
    retry_failed: bool,
) -> Vec<LedgerEntry> {
    entries
        .values()
        .filter(|entry| match entry.status {
            LedgerStatus::Pending => true,
            LedgerStatus::Failed => retry_failed,
            LedgerStatus::Complete => false,
        })
        .cloned()
        .collect()
}

/// Entry point for reading ledger state.
pub struct Ledger;

impl Ledger {
    /// Loads and reconciles the ledger in `user_dir`.
    ///
    /// A missing directory or missing files yield empty state. An unreadable
    /// snapshot yields empty state with `recovered_from_corruption` set; the
    /// journal is still replayed on top.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] only for filesystem failures other than
    /// "not found".
    pub async fn load(user_dir: &Path) -> Result<LoadedLedger, LedgerError> {
        let mut loaded = LoadedLedger::default();

        let snapshot_path = user_dir.join(LEDGER_FILE);
        if let Some(bytes) = store::read_optional(&snapshot_path).await? {
            match serde_json::from_slice::<SnapshotOwned>(&bytes) {
                Ok(snapshot) => {
                    for entry in snapshot.entries {
                        loaded.entries.insert(entry.key(), entry);
                    }
                }
                Err(error) => {
                    warn!(
                        path = %snapshot_path.display(),
                        error = %error,
                        "ledger snapshot unreadable; starting empty and re-verifying existing files"
                    );
                    loaded.recovered_from_corruption = true;
                }
            }
        }

        let journal_path = user_dir.join(JOURNAL_FILE);
        if let Some(bytes) = store::read_optional(&journal_path).await? {
            let text = String::from_utf8_lossy(&bytes);
            for (index, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) => {
                        loaded.entries.insert(entry.key(), entry);
                    }
                    Err(error) => {
                        warn!(line = index + 1, error = %error, "skipping malformed journal line");
                        loaded.journal_lines_skipped += 1;
                    }
                }
            }
        }

        let progress_path = user_dir.join(PROGRESS_FILE);
        if let Some(bytes) = store::read_optional(&progress_path).await? {
            match serde_json::from_slice::<ProgressState>(&bytes) {
                Ok(progress) => loaded.progress = progress,
                Err(error) => {
                    warn!(error = %error, "progress file unreadable; crawl restarts at offset 0");
                }
            }
        }

        for entry in loaded.entries.values_mut() {
            if entry.status != LedgerStatus::Complete {
                continue;
            }
            if !complete_file_matches(user_dir, entry).await {
                debug!(
                    post_id = %entry.post_id,
                    asset_url = %entry.asset_url,
                    "complete entry has no matching file; downgrading to pending"
                );
                entry.status = LedgerStatus::Pending;
                entry.bytes = None;
                loaded.downgraded += 1;
            }
        }

        info!(
            entries = loaded.entries.len(),
            downgraded = loaded.downgraded,
            corrupted = loaded.recovered_from_corruption,
            next_offset = loaded.progress.next_offset,
            "ledger loaded"
        );
        Ok(loaded)
    }
}

async fn complete_file_matches(user_dir: &Path, entry: &LedgerEntry) -> bool {
    let Some(path) = entry.file_path(user_dir) else {
        return false;
    };
    match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.is_file() && entry.bytes.is_none_or(|bytes| bytes == meta.len()),
        Err(_) => false,
    }
}

pub(crate) fn encode_snapshot(
    entries: &BTreeMap<AssetKey, LedgerEntry>,
    path: &Path,
) -> Result<Vec<u8>, LedgerError> {
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        entries: entries.values().collect(),
    };
    serde_json::to_vec_pretty(&snapshot).map_err(|e| LedgerError::encode(path, e))
}
