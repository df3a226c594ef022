//! Run statistics: live counters while the run is going, an immutable
//! [`RunSummary`] at the end.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::model::{DownloadOutcome, DownloadResult, FailureKind};

/// Maximum number of failure samples kept for the summary.
pub const MAX_FAILURE_SAMPLES: usize = 20;

/// Counters shared with workers and the progress spinner.
///
/// All updates are relaxed atomics; readers get a consistent-enough view for
/// display.
#[derive(Debug, Default)]
pub struct LiveCounters {
    pages_crawled: AtomicU64,
    posts_discovered: AtomicU64,
    posts_processed: AtomicU64,
    posts_failed: AtomicU64,
    assets_attempted: AtomicU64,
    assets_succeeded: AtomicU64,
    assets_skipped: AtomicU64,
    assets_failed: AtomicU64,
    assets_abandoned: AtomicU64,
    retries: AtomicU64,
    bytes_transferred: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $inc:ident, $field:ident) => {
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl LiveCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(pages_crawled, add_page, pages_crawled);
    counter!(posts_discovered, add_post_discovered, posts_discovered);
    counter!(posts_processed, add_post_processed, posts_processed);
    counter!(posts_failed, add_post_failed, posts_failed);
    counter!(assets_attempted, add_asset_attempted, assets_attempted);
    counter!(assets_succeeded, add_asset_succeeded, assets_succeeded);
    counter!(assets_skipped, add_asset_skipped, assets_skipped);
    counter!(assets_failed, add_asset_failed, assets_failed);
    counter!(retries, add_retry, retries);

    /// Assets whose transfer was aborted at shutdown.
    #[must_use]
    pub fn assets_abandoned(&self) -> u64 {
        self.assets_abandoned.load(Ordering::Relaxed)
    }

    pub(crate) fn add_abandoned(&self, count: u64) {
        self.assets_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    /// Bytes written by successful transfers.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Assets that reached a terminal outcome.
    #[must_use]
    pub fn assets_done(&self) -> u64 {
        self.assets_succeeded() + self.assets_skipped() + self.assets_failed()
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSample {
    /// Post the failure belongs to.
    pub post_id: String,
    /// Asset URL, or `None` for a post-level failure.
    pub asset_url: Option<String>,
    /// Classified failure.
    pub kind: FailureKind,
    /// Error message.
    pub message: String,
}

/// Accumulates statistics for one run.
#[derive(Debug)]
pub struct StatsCollector {
    live: Arc<LiveCounters>,
    started: Instant,
    samples: Vec<FailureSample>,
    failures_by_kind: BTreeMap<String, u64>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    /// Starts the clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_counters(Arc::new(LiveCounters::new()))
    }

    /// Starts the clock over existing shared counters.
    #[must_use]
    pub fn with_counters(live: Arc<LiveCounters>) -> Self {
        Self {
            live,
            started: Instant::now(),
            samples: Vec::new(),
            failures_by_kind: BTreeMap::new(),
        }
    }

    /// Shared counters for workers and the progress UI.
    #[must_use]
    pub fn live(&self) -> Arc<LiveCounters> {
        Arc::clone(&self.live)
    }

    /// Records a failed post expansion.
    pub fn record_post_failure(&mut self, post_id: &str, kind: FailureKind, message: &str) {
        self.live.add_post_failed();
        self.sample(FailureSample {
            post_id: post_id.to_string(),
            asset_url: None,
            kind,
            message: message.to_string(),
        });
    }

    /// Records one asset result.
    pub fn record_result(&mut self, result: &DownloadResult) {
        match &result.outcome {
            DownloadOutcome::Success { bytes_written } => {
                self.live.add_asset_succeeded();
                self.live.add_bytes(*bytes_written);
            }
            DownloadOutcome::Skipped(_) => self.live.add_asset_skipped(),
            DownloadOutcome::Failed { kind, message, .. } => {
                self.live.add_asset_failed();
                self.sample(FailureSample {
                    post_id: result.asset.post_id.clone(),
                    asset_url: Some(result.asset.asset_url.clone()),
                    kind: *kind,
                    message: message.clone(),
                });
            }
        }
    }

    fn sample(&mut self, sample: FailureSample) {
        *self
            .failures_by_kind
            .entry(sample.kind.to_string())
            .or_default() += 1;
        if self.samples.len() < MAX_FAILURE_SAMPLES {
            self.samples.push(sample);
        }
    }

    /// Freezes the statistics.
    #[must_use]
    pub fn finish(self) -> RunSummary {
        let live = &self.live;
        RunSummary {
            pages_crawled: live.pages_crawled(),
            posts_discovered: live.posts_discovered(),
            posts_processed: live.posts_processed(),
            posts_failed: live.posts_failed(),
            assets_attempted: live.assets_attempted(),
            assets_succeeded: live.assets_succeeded(),
            assets_skipped: live.assets_skipped(),
            assets_failed: live.assets_failed(),
            assets_abandoned: live.assets_abandoned(),
            retries: live.retries(),
            bytes_transferred: live.bytes_transferred(),
            elapsed: self.started.elapsed(),
            failures_by_kind: self.failures_by_kind,
            failure_samples: self.samples,
        }
    }
}

/// Immutable statistics of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Catalog pages fetched successfully.
    pub pages_crawled: u64,
    /// Posts handed out by the walker (or requested explicitly).
    pub posts_discovered: u64,
    /// Posts expanded into assets.
    pub posts_processed: u64,
    /// Posts whose page could not be fetched or parsed.
    pub posts_failed: u64,
    /// Assets queued for transfer.
    pub assets_attempted: u64,
    /// Assets written and verified.
    pub assets_succeeded: u64,
    /// Assets skipped (complete, reverified or filtered).
    pub assets_skipped: u64,
    /// Assets that failed permanently or exhausted retries.
    pub assets_failed: u64,
    /// Assets aborted at shutdown; they stay Pending.
    pub assets_abandoned: u64,
    /// Retry attempts across pages, posts and assets.
    pub retries: u64,
    /// Bytes written by successful transfers.
    pub bytes_transferred: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Failure counts keyed by kind label.
    pub failures_by_kind: BTreeMap<String, u64>,
    /// At most [`MAX_FAILURE_SAMPLES`] failures.
    pub failure_samples: Vec<FailureSample>,
}

impl RunSummary {
    /// Assets with a terminal or abandoned outcome.
    #[must_use]
    pub fn assets_total(&self) -> u64 {
        self.assets_succeeded + self.assets_skipped + self.assets_failed + self.assets_abandoned
    }

    /// Percentage of assets that are on disk at the end of the run
    /// (downloaded or skipped). 100 when there was nothing to do.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.assets_total();
        if total == 0 {
            return 100.0;
        }
        (self.assets_succeeded + self.assets_skipped) as f64 / total as f64 * 100.0
    }

    /// True if any post or asset failed or was abandoned.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.posts_failed > 0 || self.assets_failed > 0 || self.assets_abandoned > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{rule}")?;
        writeln!(f, "MIRROR SUMMARY")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Pages crawled:    {}", self.pages_crawled)?;
        writeln!(
            f,
            "Posts:            {} processed, {} failed ({} discovered)",
            self.posts_processed, self.posts_failed, self.posts_discovered
        )?;
        writeln!(f, "Assets:           {}", self.assets_total())?;
        writeln!(f, "  Downloaded:     {}", self.assets_succeeded)?;
        writeln!(f, "  Skipped:        {}", self.assets_skipped)?;
        writeln!(f, "  Failed:         {}", self.assets_failed)?;
        if self.assets_abandoned > 0 {
            writeln!(f, "  Abandoned:      {}", self.assets_abandoned)?;
        }
        writeln!(f, "Retries:          {}", self.retries)?;
        writeln!(f, "Success rate:     {:.1}%", self.success_rate())?;
        writeln!(f, "Total size:       {}", format_bytes(self.bytes_transferred))?;
        writeln!(f, "Elapsed:          {:.1}s", self.elapsed.as_secs_f64())?;

        if !self.failures_by_kind.is_empty() {
            writeln!(f, "Failures by kind:")?;
            for (kind, count) in &self.failures_by_kind {
                writeln!(f, "  {kind}: {count}")?;
            }
            writeln!(f, "Failure samples:")?;
            for sample in &self.failure_samples {
                match &sample.asset_url {
                    Some(url) => writeln!(
                        f,
                        "  [{}] post {} {url}: {}",
                        sample.kind, sample.post_id, sample.message
                    )?,
                    None => writeln!(
                        f,
                        "  [{}] post {}: {}",
                        sample.kind, sample.post_id, sample.message
                    )?,
                }
            }
        }
        write!(f, "{rule}")
    }
}

/// Formats a byte count with one decimal and a binary unit (B, KB, MB, GB, TB).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Asset, SkipReason};

    fn result(n: u32, outcome: DownloadOutcome) -> DownloadResult {
        DownloadResult {
            asset: Asset {
                asset_url: format!("https://k/data/{n}.png"),
                post_id: "1".to_string(),
                ordinal: n,
                suggested_name: None,
            },
            outcome,
        }
    }

    fn failed(n: u32) -> DownloadResult {
        result(
            n,
            DownloadOutcome::Failed {
                kind: FailureKind::HttpStatus(404),
                attempts: 1,
                message: "not found".to_string(),
            },
        )
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.0 B");
        assert_eq!(format_bytes(1023), "1023.0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024u64.pow(4)), "3.0 TB");
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut stats = StatsCollector::new();
        stats.record_result(&result(1, DownloadOutcome::Success { bytes_written: 10 }));
        stats.record_result(&result(2, DownloadOutcome::Success { bytes_written: 5 }));
        stats.record_result(&result(3, DownloadOutcome::Skipped(SkipReason::AlreadyComplete)));
        stats.record_result(&failed(4));

        let summary = stats.finish();

        assert_eq!(summary.assets_succeeded, 2);
        assert_eq!(summary.assets_skipped, 1);
        assert_eq!(summary.assets_failed, 1);
        assert_eq!(summary.bytes_transferred, 15);
        assert!((summary.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(summary.failures_by_kind.get("http_404"), Some(&1));
        assert!(summary.has_failures());
    }

    #[test]
    fn test_failure_samples_are_capped() {
        let mut stats = StatsCollector::new();
        for n in 0..50 {
            stats.record_result(&failed(n));
        }
        stats.record_post_failure("9", FailureKind::Extraction, "bad body");

        let summary = stats.finish();

        assert_eq!(summary.failure_samples.len(), MAX_FAILURE_SAMPLES);
        assert_eq!(summary.assets_failed, 50);
        assert_eq!(summary.posts_failed, 1);
        assert_eq!(summary.failures_by_kind.get("extraction"), Some(&1));
    }

    #[test]
    fn test_empty_run_has_full_success_rate() {
        let summary = StatsCollector::new().finish();
        assert!((summary.success_rate() - 100.0).abs() < f64::EPSILON);
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_live_counters_visible_before_finish() {
        let stats = StatsCollector::new();
        let live = stats.live();
        live.add_page();
        live.add_retry();
        live.add_abandoned(3);

        assert_eq!(live.pages_crawled(), 1);
        let summary = stats.finish();
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.assets_abandoned, 3);
    }

    #[test]
    fn test_summary_display_lists_failures() {
        let mut stats = StatsCollector::new();
        stats.record_result(&failed(1));
        let text = stats.finish().to_string();
        assert!(text.contains("MIRROR SUMMARY"));
        assert!(text.contains("http_404: 1"));
        assert!(text.contains("Success rate:     0.0%"));
    }
}
