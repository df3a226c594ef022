//! Creator Mirror Core Library
//!
//! This library mirrors a creator's paginated post catalog into a local,
//! deduplicated, resumable folder tree:
//! `output_root/user_{id}/post_{id}/{file}`.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`walker`] - Offset pagination over a catalog, as a lazy post stream
//! - [`scheduler`] - Post expansion and bounded-concurrency asset transfers
//! - [`ledger`] - Persistent per-asset state and crawl progress
//! - [`download`] - Transport seam, rate limiting, retry/backoff, file naming
//! - [`extract`] - Site adapters turning page bodies into posts and assets
//! - [`stats`] - Live counters and the end-of-run summary
//! - [`mirror`] - Wires the above into the `run`, `resume` and `posts` modes

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod extract;
pub mod ledger;
pub mod mirror;
pub mod model;
pub mod scheduler;
pub mod stats;
pub mod walker;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{AssetTypeFilter, ConfigError, MirrorConfig};
pub use download::{
    FetchError, Fetcher, HttpTransport, RateLimiter, RetryDecision, RetryPolicy, Transport,
};
pub use extract::{ExtractError, ExtractionAdapter, HtmlAdapter, JsonApiAdapter};
pub use ledger::{Ledger, LedgerEntry, LedgerError, LedgerStatus, ProgressState};
pub use mirror::{Mirror, MirrorError, RunReport, RunStatus};
pub use model::{Asset, DownloadOutcome, DownloadResult, FailureKind, Post, SkipReason, UserTarget};
pub use stats::{LiveCounters, RunSummary, StatsCollector, format_bytes};
pub use walker::{PageWalker, WalkEnd, WalkEvent};
