//! Core data model shared by the walker, scheduler, ledger and stats.
//!
//! All records here are created once and never mutated afterwards; they move
//! between components by value.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

/// Immutable input to a run: whose catalog to mirror and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTarget {
    /// Remote user identifier.
    pub user_id: String,
    /// Catalog URL for offset 0.
    pub base_url: Url,
    /// Directory under which `user_{user_id}` is created.
    pub output_root: PathBuf,
}

impl UserTarget {
    /// Creates a new target.
    #[must_use]
    pub fn new(user_id: impl Into<String>, base_url: Url, output_root: impl Into<PathBuf>) -> Self {
        Self {
            user_id: user_id.into(),
            base_url,
            output_root: output_root.into(),
        }
    }

    /// Directory holding this user's posts, ledger and progress files.
    #[must_use]
    pub fn user_dir(&self) -> PathBuf {
        user_dir(&self.output_root, &self.user_id)
    }
}

/// Returns `output_root/user_{user_id}`.
#[must_use]
pub fn user_dir(output_root: &Path, user_id: &str) -> PathBuf {
    output_root.join(format!("user_{user_id}"))
}

/// Returns the folder name used for a post's assets.
#[must_use]
pub fn post_dir_name(post_id: &str) -> String {
    format!("post_{post_id}")
}

/// One unit of remote content discovered on a catalog page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Stable post identifier, unique within a target.
    pub post_id: String,
    /// URL of the post page (or API object).
    pub source_url: String,
    /// Catalog offset of the page the post was found on.
    pub discovered_at_offset: u64,
}

/// One downloadable file referenced by a post.
///
/// Identity is `(post_id, asset_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Absolute URL of the file.
    pub asset_url: String,
    /// Owning post.
    pub post_id: String,
    /// 1-based position within the post.
    pub ordinal: u32,
    /// Name offered by the source, if any. Not yet sanitized.
    pub suggested_name: Option<String>,
}

impl Asset {
    /// Ledger key for this asset.
    #[must_use]
    pub fn key(&self) -> AssetKey {
        AssetKey::new(&self.post_id, &self.asset_url)
    }
}

/// Identity of an asset: `(post_id, asset_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    /// Owning post.
    pub post_id: String,
    /// Absolute URL of the file.
    pub asset_url: String,
}

impl AssetKey {
    /// Creates a key.
    #[must_use]
    pub fn new(post_id: impl Into<String>, asset_url: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            asset_url: asset_url.into(),
        }
    }
}

/// Runtime unit of work: one asset, where it goes, and how far it got.
///
/// Owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// The asset being transferred.
    pub asset: Asset,
    /// File name inside the post folder.
    pub file_name: String,
    /// Final path of the file.
    pub target_path: PathBuf,
    /// Attempts made so far.
    pub attempts: u32,
    /// A file is already at `target_path` without a trusted ledger record;
    /// probe its size before downloading again.
    pub reverify: bool,
}

/// Why an asset was not transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Ledger says Complete and the file is present.
    AlreadyComplete,
    /// File on disk matched the server's declared size.
    Reverified,
    /// Rejected by the asset type filter.
    FilteredOut,
}

impl SkipReason {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyComplete => "already_complete",
            Self::Reverified => "reverified",
            Self::FilteredOut => "filtered_out",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse failure classification recorded in results and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request timed out.
    Timeout,
    /// Connection-level failure.
    Connection,
    /// Non-success HTTP status.
    HttpStatus(u16),
    /// TLS failure.
    Tls,
    /// Malformed URL.
    InvalidUrl,
    /// Body shorter than declared.
    Truncated,
    /// Content type rejected by the filter.
    UnsupportedContentType,
    /// Local filesystem error.
    Filesystem,
    /// Page body could not be turned into posts or assets.
    Extraction,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Connection => f.write_str("connection"),
            Self::HttpStatus(status) => write!(f, "http_{status}"),
            Self::Tls => f.write_str("tls"),
            Self::InvalidUrl => f.write_str("invalid_url"),
            Self::Truncated => f.write_str("truncated"),
            Self::UnsupportedContentType => f.write_str("unsupported_content_type"),
            Self::Filesystem => f.write_str("filesystem"),
            Self::Extraction => f.write_str("extraction"),
        }
    }
}

/// Terminal outcome for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// File written and verified.
    Success {
        /// Bytes written to disk.
        bytes_written: u64,
    },
    /// Nothing transferred.
    Skipped(SkipReason),
    /// Gave up.
    Failed {
        /// Classified failure.
        kind: FailureKind,
        /// Total attempts made.
        attempts: u32,
        /// Last error message.
        message: String,
    },
}

/// Result emitted exactly once per admitted asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// The asset this result is for.
    pub asset: Asset,
    /// What happened.
    pub outcome: DownloadOutcome,
}

impl DownloadResult {
    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Success { .. })
    }

    /// Returns true for `Failed`.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Failed { .. })
    }
}
