//! Run orchestration: wires the walker, scheduler, ledger and stats for one
//! user and implements the three run modes.
//!
//! | Mode                        | Start offset          | Re-drives ledger |
//! |-----------------------------|-----------------------|------------------|
//! | [`Mirror::run_for_user`]    | 0 (progress reset)    | no               |
//! | [`Mirror::resume`]          | saved `next_offset`   | yes              |
//! | [`Mirror::run_for_posts`]   | no catalog walk       | no               |

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, MirrorConfig};
use crate::download::{FetchError, Fetcher, RateLimiter, Transport};
use crate::extract::{ExtractError, ExtractionAdapter};
use crate::ledger::{Ledger, LedgerError, ProgressState, spawn_writer};
use crate::model::{Post, UserTarget};
use crate::scheduler::{DownloadScheduler, SchedulerError, SchedulerEvent};
use crate::stats::{LiveCounters, RunSummary, StatsCollector};
use crate::walker::{PageWalker, WalkEnd, WalkEvent};

/// Events buffered between the scheduler and the stats collector.
const EVENT_BUFFER: usize = 256;

/// Errors that prevent a run from producing a report.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The catalog URL for the user could not be built.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The first catalog page answered 404.
    #[error("user {user_id} not found at {url}")]
    TargetNotFound {
        /// Requested user.
        user_id: String,
        /// Catalog URL that answered 404.
        url: String,
    },

    /// The catalog could not be fetched before any post was found.
    #[error("catalog unavailable at offset {offset}: {source}")]
    CrawlUnavailable {
        /// Offset that failed.
        offset: u64,
        /// Last fetch error.
        #[source]
        source: FetchError,
    },

    /// The ledger could not be loaded or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The scheduler stopped on an unrecoverable error.
    #[error(transparent)]
    Scheduler(SchedulerError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Everything discovered is on disk.
    Success,
    /// Some posts or assets failed, or the walk stopped early.
    PartialFailure,
    /// The cancel flag was raised from outside.
    Interrupted,
    /// The run stopped on a condition that needs attention (disk full).
    Aborted {
        /// Human-readable cause.
        reason: String,
    },
}

/// Result of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Frozen statistics.
    pub summary: RunSummary,
    /// Overall status.
    pub status: RunStatus,
    /// How the catalog walk ended, for walking modes.
    pub walk_end: Option<WalkEnd>,
    /// Offset a `resume` would start from.
    pub resume_offset: u64,
    /// The ledger snapshot was unreadable and existing files were re-verified.
    pub recovered_from_corruption: bool,
}

enum Mode {
    Fresh,
    Resume,
    Posts(Vec<String>),
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Self::Fresh => "run",
            Self::Resume => "resume",
            Self::Posts(_) => "posts",
        }
    }
}

/// Mirrors users' catalogs with one configuration, transport and adapter.
///
/// Live counters are shared by every run of the same `Mirror`; use one
/// instance per run when reading them.
pub struct Mirror {
    config: Arc<MirrorConfig>,
    transport: Arc<dyn Transport>,
    adapter: Arc<dyn ExtractionAdapter>,
    interrupted: Arc<AtomicBool>,
    live: Arc<LiveCounters>,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl Mirror {
    /// Creates a mirror.
    #[must_use]
    pub fn new(
        config: Arc<MirrorConfig>,
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn ExtractionAdapter>,
    ) -> Self {
        Self {
            config,
            transport,
            adapter,
            interrupted: Arc::new(AtomicBool::new(false)),
            live: Arc::new(LiveCounters::new()),
        }
    }

    /// Uses `flag` as the run-wide cancel flag (set it from a Ctrl-C
    /// handler).
    #[must_use]
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Counters updated while a run is in progress.
    #[must_use]
    pub fn live_counters(&self) -> Arc<LiveCounters> {
        Arc::clone(&self.live)
    }

    /// Builds the target for `user_id` under `output_root` using the
    /// adapter's catalog URL.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Extract`] if the catalog URL cannot be built.
    pub fn target(
        &self,
        user_id: &str,
        output_root: impl Into<std::path::PathBuf>,
    ) -> Result<UserTarget, MirrorError> {
        let catalog = self.adapter.catalog_url(user_id)?;
        Ok(UserTarget::new(user_id, catalog, output_root))
    }

    /// Walks the whole catalog from offset 0. Saved crawl progress is
    /// discarded; ledger entries are kept, so finished files are skipped.
    ///
    /// # Errors
    ///
    /// See [`MirrorError`].
    pub async fn run_for_user(&self, target: &UserTarget) -> Result<RunReport, MirrorError> {
        self.execute(target, Mode::Fresh).await
    }

    /// Re-attempts unfinished ledger entries, then continues the walk from
    /// the saved offset.
    ///
    /// # Errors
    ///
    /// See [`MirrorError`].
    pub async fn resume(&self, target: &UserTarget) -> Result<RunReport, MirrorError> {
        self.execute(target, Mode::Resume).await
    }

    /// Mirrors only the given posts without walking the catalog. Crawl
    /// progress is left untouched.
    ///
    /// # Errors
    ///
    /// See [`MirrorError`].
    pub async fn run_for_posts(
        &self,
        target: &UserTarget,
        post_ids: &[String],
    ) -> Result<RunReport, MirrorError> {
        self.execute(target, Mode::Posts(post_ids.to_vec())).await
    }

    #[instrument(skip_all, fields(user_id = %target.user_id, mode = mode.name()))]
    async fn execute(&self, target: &UserTarget, mode: Mode) -> Result<RunReport, MirrorError> {
        self.config.validate()?;
        let user_dir = target.user_dir();

        let loaded = Ledger::load(&user_dir).await?;
        let recovered_from_corruption = loaded.recovered_from_corruption;
        if loaded.downgraded > 0 {
            info!(
                downgraded = loaded.downgraded,
                "completed files missing or changed; marked pending"
            );
        }

        let (progress, redrive) = match &mode {
            Mode::Fresh => (ProgressState::default(), Vec::new()),
            Mode::Resume => (
                loaded.progress.clone(),
                loaded.redrive(self.config.retry_failed),
            ),
            Mode::Posts(_) => (loaded.progress.clone(), Vec::new()),
        };
        let explicit = match &mode {
            Mode::Posts(ids) => Some(self.explicit_posts(target, ids)?),
            Mode::Fresh | Mode::Resume => None,
        };
        let start_offset = progress.next_offset;
        info!(
            start_offset,
            redrive = redrive.len(),
            known = loaded.entries.len(),
            "starting run"
        );

        let (ledger, writer_task) = spawn_writer(
            user_dir.clone(),
            loaded,
            progress,
            self.config.ledger_snapshot_every,
        )
        .await?;

        let rate_limiter = Arc::new(
            RateLimiter::new(self.config.request_delay, self.config.max_in_flight_requests)
                .with_batch_pause(self.config.batch_size, self.config.batch_pause),
        );
        let fetcher = Fetcher::new(
            &self.config,
            Arc::clone(&self.transport),
            rate_limiter,
            Arc::clone(&self.interrupted),
            Arc::clone(&self.live),
        );

        let mut scheduler = DownloadScheduler::new(
            Arc::clone(&self.config),
            fetcher.clone(),
            Arc::clone(&self.adapter),
            ledger.clone(),
            user_dir,
        );
        let input: BoxStream<'static, WalkEvent> = match explicit {
            Some(posts) => {
                scheduler = scheduler.without_progress();
                stream::iter(posts.into_iter().map(WalkEvent::Post)).boxed()
            }
            None => {
                let walker = PageWalker::new(&self.config, fetcher, Arc::clone(&self.adapter));
                limit_posts(
                    walker.walk(target.base_url.clone(), start_offset),
                    self.config.max_posts,
                )
                .boxed()
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let collector = StatsCollector::with_counters(Arc::clone(&self.live));
        let (outcome, stats) = tokio::join!(
            scheduler.run(redrive, input, tx),
            collect(collector, rx)
        );

        let resume_offset = ledger.progress().await.map(|p| p.next_offset);
        if let Err(e) = ledger.shutdown().await {
            warn!(error = %e, "ledger writer already stopped");
        }
        if let Err(e) = writer_task.await {
            warn!(error = %e, "ledger writer task failed");
        }
        let resume_offset = resume_offset?;
        let summary = stats.finish();

        let report = match outcome {
            Ok(report) => report,
            Err(SchedulerError::StorageFull { path }) => {
                let reason = format!("disk full while writing {}", path.display());
                warn!(%reason, "run aborted");
                return Ok(RunReport {
                    summary,
                    status: RunStatus::Aborted { reason },
                    walk_end: None,
                    resume_offset,
                    recovered_from_corruption,
                });
            }
            Err(e) => return Err(MirrorError::Scheduler(e)),
        };

        let nothing_found = summary.posts_discovered == 0;
        let walk_end = match report.walk_end {
            Some(WalkEnd::NotFound { offset: 0 }) if nothing_found => {
                return Err(MirrorError::TargetNotFound {
                    user_id: target.user_id.clone(),
                    url: target.base_url.to_string(),
                });
            }
            Some(WalkEnd::FetchFailed { offset, error }) if nothing_found && offset == start_offset => {
                return Err(MirrorError::CrawlUnavailable {
                    offset,
                    source: error,
                });
            }
            other => other,
        };

        let status = if report.interrupted {
            RunStatus::Interrupted
        } else if summary.has_failures() || walk_end.as_ref().is_some_and(|end| !end.is_complete()) {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };

        info!(
            ?status,
            succeeded = summary.assets_succeeded,
            skipped = summary.assets_skipped,
            failed = summary.assets_failed,
            resume_offset,
            "run finished"
        );
        Ok(RunReport {
            summary,
            status,
            walk_end,
            resume_offset,
            recovered_from_corruption,
        })
    }

    fn explicit_posts(&self, target: &UserTarget, ids: &[String]) -> Result<Vec<Post>, MirrorError> {
        ids.iter()
            .map(|post_id| {
                let source_url = self.adapter.post_url(&target.base_url, post_id)?;
                Ok(Post {
                    post_id: post_id.clone(),
                    source_url: source_url.to_string(),
                    discovered_at_offset: 0,
                })
            })
            .collect()
    }
}

async fn collect(
    mut stats: StatsCollector,
    mut rx: mpsc::Receiver<SchedulerEvent>,
) -> StatsCollector {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::PostExpanded { .. } => {}
            SchedulerEvent::PostFailed {
                post_id,
                kind,
                message,
            } => stats.record_post_failure(&post_id, kind, &message),
            SchedulerEvent::Asset(result) => stats.record_result(&result),
        }
    }
    stats
}

/// Stops the walk once `max_posts` posts have been yielded. The page holding
/// the last post is still completed; later posts on it are dropped and the
/// next page is never fetched.
fn limit_posts<S>(input: S, max_posts: Option<usize>) -> impl futures_util::Stream<Item = WalkEvent> + Send
where
    S: futures_util::Stream<Item = WalkEvent> + Send + 'static,
{
    struct Limit<S> {
        input: std::pin::Pin<Box<S>>,
        remaining: Option<usize>,
        stop: bool,
    }

    let state = Limit {
        input: Box::pin(input),
        remaining: max_posts,
        stop: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.stop {
            return None;
        }
        loop {
            let event = state.input.next().await?;
            match &event {
                WalkEvent::Post(_) => match state.remaining.as_mut() {
                    Some(0) => continue,
                    Some(left) => *left -= 1,
                    None => {}
                },
                WalkEvent::PageComplete { .. } => {
                    if state.remaining == Some(0) {
                        info!("post limit reached");
                        state.stop = true;
                    }
                }
                WalkEvent::Finished(_) => {}
            }
            return Some((event, state));
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::extract::JsonApiAdapter;
    use crate::ledger::{LEDGER_FILE, LedgerStatus};
    use crate::test_support::scripted::{Reply, ScriptedTransport};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use url::Url;

    const CATALOG: &str = "https://k.test/api/v1/svc/user/7/posts";

    fn config() -> MirrorConfig {
        MirrorConfig {
            request_delay: Duration::ZERO,
            retry_jitter: Duration::ZERO,
            retry_delay: Duration::from_millis(100),
            batch_pause: Duration::ZERO,
            page_size: Some(2),
            ..MirrorConfig::default()
        }
    }

    fn adapter() -> Arc<JsonApiAdapter> {
        let site = Url::parse("https://k.test").unwrap();
        Arc::new(JsonApiAdapter::new(site, "svc"))
    }

    fn post_url(id: &str) -> String {
        format!("https://k.test/api/v1/svc/user/7/post/{id}")
    }

    fn page(transport: &ScriptedTransport, offset: u64, ids: &[&str]) {
        let url = if offset == 0 {
            CATALOG.to_string()
        } else {
            format!("{CATALOG}?o={offset}")
        };
        let listed: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
        transport.route(url, Reply::json(&json!(listed)));
    }

    fn post(transport: &ScriptedTransport, id: &str, files: &[&str]) {
        let attachments: Vec<_> = files
            .iter()
            .map(|name| json!({ "name": name, "path": format!("/{id}/{name}") }))
            .collect();
        transport.route(
            post_url(id),
            Reply::json(&json!({ "post": { "attachments": attachments } })),
        );
        for name in files {
            transport.route(
                format!("https://k.test/data/{id}/{name}"),
                Reply::body(format!("bytes of {name}")),
            );
        }
    }

    /// Two pages of two posts, one image each, then an empty page.
    fn catalog() -> ScriptedTransport {
        let transport = ScriptedTransport::new();
        page(&transport, 0, &["1", "2"]);
        page(&transport, 2, &["3", "4"]);
        page(&transport, 4, &[]);
        for id in ["1", "2", "3", "4"] {
            post(&transport, id, &["a.png"]);
        }
        transport
    }

    fn mirror(config: MirrorConfig, transport: &Arc<ScriptedTransport>) -> Mirror {
        Mirror::new(
            Arc::new(config),
            Arc::clone(transport) as Arc<dyn Transport>,
            adapter(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_user_mirrors_catalog() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(catalog());
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(matches!(report.walk_end, Some(WalkEnd::Exhausted { offset: 4 })));
        assert_eq!(report.summary.posts_processed, 4);
        assert_eq!(report.summary.assets_succeeded, 4);
        assert_eq!(report.resume_offset, 4);
        let file = dir.path().join("user_7/post_3/a.png");
        assert_eq!(std::fs::read_to_string(file).unwrap(), "bytes of a.png");
        assert!(dir.path().join("user_7").join(LEDGER_FILE).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_skips_without_fetching_assets() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(catalog());
        let first = mirror(config(), &transport);
        let target = first.target("7", dir.path()).unwrap();
        first.run_for_user(&target).await.unwrap();
        let fetched = transport.count_matching("/data/");

        let second = mirror(config(), &transport);
        let report = second.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.assets_skipped, 4);
        assert_eq!(report.summary.assets_succeeded, 0);
        assert_eq!(transport.count_matching("/data/"), fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_user_is_target_not_found() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let err = mirror.run_for_user(&target).await.unwrap_err();
        assert!(matches!(err, MirrorError::TargetNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_catalog_is_crawl_unavailable() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(CATALOG, Reply::status(503));
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let err = mirror.run_for_user(&target).await.unwrap_err();
        assert!(matches!(err, MirrorError::CrawlUnavailable { offset: 0, .. }));
        assert_eq!(transport.get_count(CATALOG), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_asset_is_partial_failure() {
        let dir = TempDir::new().unwrap();
        let transport = catalog();
        transport.replace("https://k.test/data/2/a.png", Reply::status(404));
        let transport = Arc::new(transport);
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.summary.assets_failed, 1);
        assert_eq!(report.summary.failures_by_kind.get("http_404"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_from_saved_offset() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(catalog());
        let first = mirror(
            MirrorConfig {
                max_posts: Some(2),
                ..config()
            },
            &transport,
        );
        let target = first.target("7", dir.path()).unwrap();

        let report = first.run_for_user(&target).await.unwrap();
        assert_eq!(report.summary.posts_processed, 2);
        assert_eq!(report.resume_offset, 2);
        assert_eq!(transport.get_count(&format!("{CATALOG}?o=2")), 0);

        let second = mirror(config(), &transport);
        let report = second.resume(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.posts_processed, 2);
        assert_eq!(report.summary.assets_succeeded, 2);
        assert_eq!(transport.get_count(CATALOG), 1);
        assert!(dir.path().join("user_7/post_4/a.png").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_redrives_pending_entries() {
        let dir = TempDir::new().unwrap();
        let transport = catalog();
        transport.replace("https://k.test/data/1/a.png", Reply::DiskFull);
        let transport = Arc::new(transport);
        let first = mirror(
            MirrorConfig {
                max_concurrent_downloads: 1,
                ..config()
            },
            &transport,
        );
        let target = first.target("7", dir.path()).unwrap();

        let report = first.run_for_user(&target).await.unwrap();
        assert!(matches!(report.status, RunStatus::Aborted { .. }));

        let loaded = Ledger::load(&target.user_dir()).await.unwrap();
        let entry = loaded
            .entries
            .values()
            .find(|entry| entry.post_id == "1")
            .unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);

        transport.replace("https://k.test/data/1/a.png", Reply::body("recovered"));
        let second = mirror(config(), &transport);
        let report = second.resume(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        let file = dir.path().join("user_7/post_1/a.png");
        assert_eq!(std::fs::read_to_string(file).unwrap(), "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_posts_skips_catalog_and_keeps_progress() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(catalog());
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let report = mirror
            .run_for_posts(&target, &["3".to_string()])
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(report.walk_end.is_none());
        assert_eq!(report.summary.assets_succeeded, 1);
        assert_eq!(report.resume_offset, 0);
        assert_eq!(transport.count_matching("/posts"), 0);
        assert!(dir.path().join("user_7/post_3/a.png").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_start_reports_interrupted() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(catalog());
        let flag = Arc::new(AtomicBool::new(true));
        let mirror = mirror(config(), &transport).with_interrupt_flag(flag);
        let target = mirror.target("7", dir.path()).unwrap();

        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert!(report.walk_end.is_none());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_pages_of_posts_with_two_files_each() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new().with_latency(Duration::from_millis(10));
        let ids: Vec<String> = (1..=28).map(|n| n.to_string()).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        page(&transport, 0, &refs[..25]);
        page(&transport, 25, &refs[25..]);
        page(&transport, 50, &[]);
        for id in &refs {
            post(&transport, id, &["a.png", "b.jpg"]);
        }
        let transport = Arc::new(transport);
        let config = MirrorConfig {
            max_concurrent_downloads: 3,
            max_in_flight_requests: 3,
            page_size: Some(25),
            ..config()
        };
        let mirror = mirror(config, &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.posts_processed, 28);
        assert_eq!(report.summary.assets_succeeded, 56);
        assert!((report.summary.success_rate() - 100.0).abs() < f64::EPSILON);
        assert!(transport.peak_in_flight() <= 3);
        let folders = std::fs::read_dir(dir.path().join("user_7"))
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path().is_dir())
            .count();
        assert_eq!(folders, 28);
        let loaded = Ledger::load(&dir.path().join("user_7")).await.unwrap();
        let complete = loaded
            .entries
            .values()
            .filter(|entry| entry.status == LedgerStatus::Complete)
            .count();
        assert_eq!(complete, 56);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_waits_are_honored() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new();
        page(&transport, 0, &["1"]);
        page(&transport, 2, &[]);
        transport.route(
            post_url("1"),
            Reply::json(&json!({ "post": { "file": { "name": "a.png", "path": "/1/a.png" } } })),
        );
        let file_url = "https://k.test/data/1/a.png";
        transport.route(file_url, Reply::too_many_requests("5"));
        transport.route(file_url, Reply::too_many_requests("5"));
        transport.route(file_url, Reply::body("finally"));
        let transport = Arc::new(transport);
        let mirror = mirror(config(), &transport);
        let target = mirror.target("7", dir.path()).unwrap();

        let started = tokio::time::Instant::now();
        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.assets_succeeded, 1);
        assert_eq!(transport.get_count(file_url), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    fn attachments(transport: &ScriptedTransport, id: &str, files: &[(&str, &str)]) {
        let listed: Vec<_> = files
            .iter()
            .map(|(name, path)| json!({ "name": name, "path": path }))
            .collect();
        transport.replace(
            post_url(id),
            Reply::json(&json!({ "post": { "attachments": listed } })),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_asset_sharing_a_name_does_not_overwrite_existing_file() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new();
        page(&transport, 0, &["1"]);
        page(&transport, 2, &[]);
        attachments(&transport, "1", &[("a.png", "/1/old.png")]);
        transport.route("https://k.test/data/1/old.png", Reply::body("old"));
        transport.route("https://k.test/data/1/new.png", Reply::body("new"));
        let transport = Arc::new(transport);
        let first = mirror(config(), &transport);
        let target = first.target("7", dir.path()).unwrap();
        first.run_for_user(&target).await.unwrap();

        // The post now lists a different file under the same name, first.
        attachments(
            &transport,
            "1",
            &[("a.png", "/1/new.png"), ("a.png", "/1/old.png")],
        );
        let second = mirror(config(), &transport);
        let report = second.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.assets_skipped, 1);
        assert_eq!(report.summary.assets_succeeded, 1);
        assert_eq!(transport.get_count("https://k.test/data/1/old.png"), 1);
        let post_dir = dir.path().join("user_7/post_1");
        assert_eq!(std::fs::read_to_string(post_dir.join("a.png")).unwrap(), "old");
        let mut others: Vec<String> = std::fs::read_dir(&post_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "a.png")
            .collect();
        assert_eq!(others.len(), 1);
        let renamed = others.pop().unwrap();
        assert!(renamed.starts_with("a_") && renamed.ends_with(".png"), "{renamed}");
        assert_eq!(std::fs::read_to_string(post_dir.join(renamed)).unwrap(), "new");
    }

    const SLOW_FILE: &str = "https://k.test/data/1/a.png";

    /// One post with one file; every request takes ten seconds.
    fn slow_catalog() -> Arc<ScriptedTransport> {
        let transport = ScriptedTransport::new().with_latency(Duration::from_secs(10));
        page(&transport, 0, &["1"]);
        page(&transport, 2, &[]);
        post(&transport, "1", &["a.png"]);
        Arc::new(transport)
    }

    /// Raises `flag` five seconds into the first transfer of [`SLOW_FILE`].
    fn interrupt_mid_transfer(transport: &Arc<ScriptedTransport>, flag: &Arc<AtomicBool>) {
        let transport = Arc::clone(transport);
        let flag = Arc::clone(flag);
        tokio::spawn(async move {
            while transport.get_count(SLOW_FILE) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_lets_transfer_finish_within_grace() {
        let dir = TempDir::new().unwrap();
        let transport = slow_catalog();
        let flag = Arc::new(AtomicBool::new(false));
        let config = MirrorConfig {
            shutdown_grace: Duration::from_secs(30),
            ..config()
        };
        let mirror = mirror(config, &transport).with_interrupt_flag(Arc::clone(&flag));
        let target = mirror.target("7", dir.path()).unwrap();
        interrupt_mid_transfer(&transport, &flag);

        let report = mirror.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.summary.assets_succeeded, 1);
        assert_eq!(report.summary.assets_abandoned, 0);
        assert!(dir.path().join("user_7/post_1/a.png").exists());
        let loaded = Ledger::load(&target.user_dir()).await.unwrap();
        let entry = loaded.entries.values().next().unwrap();
        assert_eq!(entry.status, LedgerStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_aborts_transfer_after_grace_and_resume_redrives_it() {
        let dir = TempDir::new().unwrap();
        let transport = slow_catalog();
        let flag = Arc::new(AtomicBool::new(false));
        let hasty = MirrorConfig {
            shutdown_grace: Duration::from_secs(1),
            ..config()
        };
        let first = mirror(hasty, &transport).with_interrupt_flag(Arc::clone(&flag));
        let target = first.target("7", dir.path()).unwrap();
        interrupt_mid_transfer(&transport, &flag);

        let report = first.run_for_user(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.summary.assets_succeeded, 0);
        assert_eq!(report.summary.assets_abandoned, 1);
        assert!(!dir.path().join("user_7/post_1/a.png").exists());
        let loaded = Ledger::load(&target.user_dir()).await.unwrap();
        let entry = loaded.entries.values().next().unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);

        let second = mirror(config(), &transport);
        let report = second.resume(&target).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.summary.assets_succeeded, 1);
        assert_eq!(transport.get_count(SLOW_FILE), 2);
        let file = dir.path().join("user_7/post_1/a.png");
        assert_eq!(std::fs::read_to_string(file).unwrap(), "bytes of a.png");
    }
}
