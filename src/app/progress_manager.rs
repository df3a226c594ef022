//! Progress UI (spinner) for mirror runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use mirror_core::{LiveCounters, format_bytes};
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_millis(100);
const REFRESH: Duration = Duration::from_millis(120);

/// Running spinner, or a no-op when the terminal should stay quiet.
pub(crate) struct ProgressUi {
    task: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ProgressUi {
    /// Starts redrawing from `live` when `use_spinner` is set.
    pub(crate) fn start(use_spinner: bool, live: Arc<LiveCounters>) -> Self {
        let stop = Arc::new(AtomicBool::new(!use_spinner));
        let task = use_spinner.then(|| tokio::spawn(redraw(live, Arc::clone(&stop))));
        Self { task, stop }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.task.is_some() && !self.stop.load(Ordering::SeqCst)
    }

    /// Clears the spinner and waits for its task.
    pub(crate) async fn finish(self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task {
            let _ = task.await;
        }
    }
}

async fn redraw(live: Arc<LiveCounters>, stop: Arc<AtomicBool>) {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(TICK);

    while !stop.load(Ordering::SeqCst) {
        spinner.set_message(status_line(&live));
        tokio::time::sleep(REFRESH).await;
    }

    spinner.finish_and_clear();
}

fn status_line(live: &LiveCounters) -> String {
    format!(
        "{} pages | {} posts | {}/{} files done, {} failed | {}",
        live.pages_crawled(),
        live.posts_processed(),
        live.assets_done(),
        live.assets_attempted() + live.assets_skipped(),
        live.assets_failed(),
        format_bytes(live.bytes_transferred()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_ui_spawns_nothing() {
        let ui = ProgressUi::start(false, Arc::new(LiveCounters::new()));

        assert!(ui.task.is_none());
        assert!(!ui.is_running());
        ui.finish().await;
    }

    #[tokio::test]
    async fn test_enabled_ui_stops_on_finish() {
        let ui = ProgressUi::start(true, Arc::new(LiveCounters::new()));

        assert!(ui.is_running());
        ui.finish().await;
    }

    #[test]
    fn test_status_line_reads_counters() {
        let live = LiveCounters::new();
        assert_eq!(
            status_line(&live),
            "0 pages | 0 posts | 0/0 files done, 0 failed | 0.0 B"
        );
    }
}
