//! Offset pagination over a user's catalog.
//!
//! [`PageWalker::walk`] returns a lazy stream: a page is fetched only when the
//! consumer has drained the posts of the previous one. The stream always ends
//! with exactly one [`WalkEvent::Finished`] carrying the reason.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::download::{FetchError, FetchOutcome, Fetcher};
use crate::extract::ExtractionAdapter;
use crate::model::Post;

/// Item yielded by the walker.
#[derive(Debug)]
pub enum WalkEvent {
    /// A post not seen earlier in this run.
    Post(Post),
    /// Every new post of the page at `offset` has been yielded.
    PageComplete {
        /// Offset of the page.
        offset: u64,
        /// Offset of the following page.
        next_offset: u64,
        /// New posts yielded from this page.
        posts: usize,
    },
    /// The walk is over.
    Finished(WalkEnd),
}

/// Why a walk stopped.
#[derive(Debug)]
pub enum WalkEnd {
    /// A page came back with no posts.
    Exhausted {
        /// Offset of the empty page.
        offset: u64,
    },
    /// Too many consecutive pages contained only posts already seen.
    RepeatLimit {
        /// Offset the walk would have fetched next.
        offset: u64,
    },
    /// The run-wide cancel flag was raised.
    Interrupted {
        /// Offset that was about to be fetched.
        offset: u64,
    },
    /// The page could not be fetched; resume from `offset`.
    FetchFailed {
        /// Offset of the failed page.
        offset: u64,
        /// Last fetch error.
        error: FetchError,
    },
    /// The page body could not be parsed.
    ExtractFailed {
        /// Offset of the page.
        offset: u64,
        /// Parser message.
        message: String,
    },
    /// The server answered 404.
    NotFound {
        /// Offset of the page.
        offset: u64,
    },
}

impl WalkEnd {
    /// Offset a later run should resume from.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Exhausted { offset }
            | Self::RepeatLimit { offset }
            | Self::Interrupted { offset }
            | Self::FetchFailed { offset, .. }
            | Self::ExtractFailed { offset, .. }
            | Self::NotFound { offset } => *offset,
        }
    }

    /// True when the catalog was walked to its end.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::RepeatLimit { .. })
    }
}

/// Drives offset pagination through a [`Fetcher`] and an
/// [`ExtractionAdapter`].
#[derive(Clone)]
pub struct PageWalker {
    fetcher: Fetcher,
    adapter: Arc<dyn ExtractionAdapter>,
    page_size: Option<u64>,
    max_repeat_pages: u32,
}

struct WalkState {
    walker: PageWalker,
    catalog: Url,
    offset: u64,
    seen: HashSet<String>,
    repeats: u32,
    buffer: VecDeque<WalkEvent>,
    done: bool,
}

enum Step {
    Continue,
    Stop(WalkEnd),
}

impl PageWalker {
    /// Creates a walker.
    #[must_use]
    pub fn new(config: &MirrorConfig, fetcher: Fetcher, adapter: Arc<dyn ExtractionAdapter>) -> Self {
        Self {
            fetcher,
            adapter,
            page_size: config.page_size,
            max_repeat_pages: config.max_repeat_pages.max(1),
        }
    }

    /// Walks `catalog` starting at `start_offset`.
    ///
    /// Only one page of posts is buffered. Dropping the stream stops the walk.
    pub fn walk(
        &self,
        catalog: Url,
        start_offset: u64,
    ) -> impl Stream<Item = WalkEvent> + Send + 'static {
        let state = WalkState {
            walker: self.clone(),
            catalog,
            offset: start_offset,
            seen: HashSet::new(),
            repeats: 0,
            buffer: VecDeque::new(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Some((event, state));
                }
                if state.done {
                    return None;
                }
                if let Step::Stop(end) = state.step().await {
                    info!(?end, "catalog walk finished");
                    state.buffer.push_back(WalkEvent::Finished(end));
                    state.done = true;
                }
            }
        })
    }
}

impl WalkState {
    async fn step(&mut self) -> Step {
        let offset = self.offset;
        let fetcher = &self.walker.fetcher;

        if fetcher.is_interrupted() {
            return Step::Stop(WalkEnd::Interrupted { offset });
        }

        let page_url = match self.walker.adapter.page_url(&self.catalog, offset) {
            Ok(url) => url,
            Err(e) => {
                return Step::Stop(WalkEnd::ExtractFailed {
                    offset,
                    message: e.to_string(),
                });
            }
        };

        debug!(offset, url = %page_url, "fetching catalog page");
        let body = match fetcher.fetch(page_url.as_str()).await {
            FetchOutcome::Fetched { value, .. } => value,
            FetchOutcome::Interrupted { .. } => {
                return Step::Stop(WalkEnd::Interrupted { offset });
            }
            FetchOutcome::Failed { error, .. } if error.status() == Some(404) => {
                return Step::Stop(WalkEnd::NotFound { offset });
            }
            FetchOutcome::Failed { error, attempts, .. } => {
                warn!(offset, attempts, error = %error, "catalog page fetch failed");
                return Step::Stop(WalkEnd::FetchFailed { offset, error });
            }
        };
        fetcher.live().add_page();

        let posts = match self
            .walker
            .adapter
            .extract_posts(&page_url, offset, &body.bytes)
        {
            Ok(posts) => posts,
            Err(e) => {
                return Step::Stop(WalkEnd::ExtractFailed {
                    offset,
                    message: e.to_string(),
                });
            }
        };

        if posts.is_empty() {
            return Step::Stop(WalkEnd::Exhausted { offset });
        }

        let listed = posts.len();
        let advance = self.walker.page_size.unwrap_or(listed as u64);
        let next_offset = offset + advance.max(1);

        let fresh: Vec<Post> = posts
            .into_iter()
            .filter(|post| self.seen.insert(post.post_id.clone()))
            .collect();
        let fresh_count = fresh.len();

        debug!(offset, listed, fresh = fresh_count, "catalog page parsed");
        self.buffer.extend(fresh.into_iter().map(WalkEvent::Post));
        self.buffer.push_back(WalkEvent::PageComplete {
            offset,
            next_offset,
            posts: fresh_count,
        });
        self.offset = next_offset;

        if fresh_count == 0 {
            self.repeats += 1;
            warn!(
                offset,
                repeats = self.repeats,
                "catalog page repeated posts already seen"
            );
            if self.repeats >= self.walker.max_repeat_pages {
                return Step::Stop(WalkEnd::RepeatLimit {
                    offset: next_offset,
                });
            }
        } else {
            self.repeats = 0;
        }
        Step::Continue
    }
}
