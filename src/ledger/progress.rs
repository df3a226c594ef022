//! Crawl progress and the page tracker that decides when it may advance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a resumed crawl starts, and what the previous run saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Offset of the last page whose every post was expanded.
    pub last_post_offset_processed: Option<u64>,
    /// Offset the walker resumes from.
    pub next_offset: u64,
    /// Posts reported by completed pages.
    pub total_posts_seen: u64,
    /// Assets found by expanded posts.
    pub total_assets_seen: u64,
    /// Last time the state changed.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct PageSlot {
    /// Set once the walker reports the page complete.
    expected_posts: Option<usize>,
    next_offset: u64,
    expanded: usize,
}

impl PageSlot {
    fn is_done(&self) -> bool {
        self.expected_posts
            .is_some_and(|expected| self.expanded >= expected)
    }
}

/// Tracks pages until all of their posts are expanded.
///
/// Post expansions and page completions may arrive in either order; progress
/// only ever moves past a contiguous prefix of finished pages.
#[derive(Debug, Default)]
pub struct PageTracker {
    pages: BTreeMap<u64, PageSlot>,
}

impl PageTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that one post from the page at `offset` was expanded.
    pub fn post_expanded(&mut self, offset: u64) {
        self.pages.entry(offset).or_default().expanded += 1;
    }

    /// Records that the walker finished the page at `offset` after handing
    /// out `posts` posts.
    pub fn page_complete(&mut self, offset: u64, next_offset: u64, posts: usize) {
        let slot = self.pages.entry(offset).or_default();
        slot.expected_posts = Some(posts);
        slot.next_offset = next_offset;
    }

    /// Pops every finished page at the front and moves `progress` past it.
    ///
    /// Returns true if `progress` changed.
    pub fn advance(&mut self, progress: &mut ProgressState) -> bool {
        let mut changed = false;
        while let Some(entry) = self.pages.first_entry() {
            if !entry.get().is_done() {
                break;
            }
            let offset = *entry.key();
            let slot = entry.remove();
            progress.last_post_offset_processed = Some(offset);
            progress.next_offset = slot.next_offset;
            progress.total_posts_seen += slot.expected_posts.unwrap_or(0) as u64;
            changed = true;
        }
        if changed {
            progress.updated_at = Some(Utc::now());
        }
        changed
    }

    /// Number of pages still waiting on expansions.
    #[must_use]
    pub fn pending_pages(&self) -> usize {
        self.pages.len()
    }
}
