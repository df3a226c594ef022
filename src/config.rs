//! Run configuration shared by every component.
//!
//! A [`MirrorConfig`] is built once (defaults, then config file, then CLI
//! flags), validated, wrapped in an `Arc` and never mutated during the run.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::download::constants::DEFAULT_USER_AGENT;
use crate::download::filename::{
    MediaCategory, category_from_content_type, category_from_extension, extension_from_url,
};

/// Default number of concurrent asset transfers.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 30;

/// Inclusive range accepted for `max_concurrent_downloads`.
pub const CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=100;

/// Errors raised by [`MirrorConfig::validate`] and filter parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Concurrency outside [`CONCURRENCY_RANGE`].
    #[error("max_concurrent_downloads must be between 1 and 100, got {0}")]
    InvalidConcurrency(usize),

    /// A count that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroValue {
        /// Offending field name.
        field: &'static str,
    },

    /// `max_retry_delay` below `retry_delay`.
    #[error("max_retry_delay ({max:?}) must not be below retry_delay ({base:?})")]
    RetryDelayCap {
        /// Base delay.
        base: Duration,
        /// Cap.
        max: Duration,
    },

    /// Empty user agent.
    #[error("user_agent must not be empty")]
    EmptyUserAgent,

    /// Unknown asset type filter name.
    #[error("unknown asset type filter '{0}' (expected all, images or media)")]
    UnknownAssetFilter(String),
}

/// Which assets a run keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssetTypeFilter {
    /// Every asset.
    All,
    /// Images only.
    #[default]
    Images,
    /// Images, video and audio.
    Media,
}

impl AssetTypeFilter {
    fn allows(self, category: MediaCategory) -> bool {
        match self {
            Self::All => true,
            Self::Images => category == MediaCategory::Image,
            Self::Media => matches!(
                category,
                MediaCategory::Image | MediaCategory::Video | MediaCategory::Audio
            ),
        }
    }

    /// Admission check on the asset URL.
    ///
    /// URLs without a recognizable extension are admitted; the content-type
    /// check at transfer time decides for them.
    #[must_use]
    pub fn admits_url(self, asset_url: &str, suggested_name: Option<&str>) -> bool {
        if self == Self::All {
            return true;
        }
        let ext = extension_from_url(asset_url).or_else(|| {
            suggested_name
                .and_then(|name| name.rfind('.').map(|pos| name[pos..].to_lowercase()))
        });
        match ext {
            Some(ext) => match category_from_extension(&ext) {
                MediaCategory::Other => false,
                category => self.allows(category),
            },
            None => true,
        }
    }

    /// Transfer-time check on the declared Content-Type.
    ///
    /// Missing or untyped (`application/octet-stream`) bodies are accepted.
    #[must_use]
    pub fn admits_content_type(self, content_type: Option<&str>) -> bool {
        if self == Self::All {
            return true;
        }
        match content_type.and_then(category_from_content_type) {
            Some(category) => self.allows(category),
            None => true,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Images => "images",
            Self::Media => "media",
        }
    }
}

impl fmt::Display for AssetTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetTypeFilter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "images" | "image" => Ok(Self::Images),
            "media" => Ok(Self::Media),
            other => Err(ConfigError::UnknownAssetFilter(other.to_string())),
        }
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Worker pool size (1..=100).
    pub max_concurrent_downloads: usize,
    /// Ceiling on outstanding HTTP requests across walker and workers.
    pub max_in_flight_requests: usize,
    /// Minimum spacing between request starts.
    pub request_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay.
    pub retry_delay: Duration,
    /// Backoff cap.
    pub max_retry_delay: Duration,
    /// Upper bound of random jitter added to each backoff. Zero disables it.
    pub retry_jitter: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Skip assets the ledger marks Complete when the file is present.
    pub skip_existing: bool,
    /// Validate TLS certificates.
    pub verify_ssl: bool,
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// Restrict the run to these post IDs.
    pub post_filter: Option<BTreeSet<String>>,
    /// Which assets to keep.
    pub asset_type_filter: AssetTypeFilter,
    /// Consecutive pages without new posts before the walker gives up.
    pub max_repeat_pages: u32,
    /// Fixed catalog page size; `None` advances by the posts found.
    pub page_size: Option<u64>,
    /// Stop crawling after this many posts.
    pub max_posts: Option<usize>,
    /// Pause `batch_pause` after every `batch_size` requests. Zero disables.
    pub batch_size: usize,
    /// See `batch_size`.
    pub batch_pause: Duration,
    /// Re-attempt assets the ledger marks Failed on resume.
    pub retry_failed: bool,
    /// Compact the ledger journal every N updates.
    pub ledger_snapshot_every: usize,
    /// How long in-flight transfers may finish after an interrupt.
    pub shutdown_grace: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_in_flight_requests: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            request_delay: Duration::from_millis(500),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            skip_existing: true,
            verify_ssl: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            post_filter: None,
            asset_type_filter: AssetTypeFilter::default(),
            max_repeat_pages: 3,
            page_size: Some(50),
            max_posts: None,
            batch_size: 50,
            batch_pause: Duration::from_millis(300),
            retry_failed: false,
            ledger_snapshot_every: 100,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl MirrorConfig {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !CONCURRENCY_RANGE.contains(&self.max_concurrent_downloads) {
            return Err(ConfigError::InvalidConcurrency(
                self.max_concurrent_downloads,
            ));
        }
        if self.max_in_flight_requests == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_in_flight_requests",
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroValue { field: "timeout" });
        }
        if self.max_repeat_pages == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_repeat_pages",
            });
        }
        if self.page_size == Some(0) {
            return Err(ConfigError::ZeroValue { field: "page_size" });
        }
        if self.ledger_snapshot_every == 0 {
            return Err(ConfigError::ZeroValue {
                field: "ledger_snapshot_every",
            });
        }
        if self.max_retry_delay < self.retry_delay {
            return Err(ConfigError::RetryDelayCap {
                base: self.retry_delay,
                max: self.max_retry_delay,
            });
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::EmptyUserAgent);
        }
        Ok(())
    }

    /// Returns true if `post_id` passes the post filter.
    #[must_use]
    pub fn accepts_post(&self, post_id: &str) -> bool {
        self.post_filter
            .as_ref()
            .is_none_or(|filter| filter.contains(post_id))
    }
}
