//! Adapter for the public HTML catalog and post pages.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};
use url::Url;

use super::{ExtractError, ExtractionAdapter, number_assets};
use crate::model::{Asset, Post};

/// One `<article>` card on a catalog page.
#[allow(clippy::expect_used)]
static ARTICLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<article\b[^>]*>(.*?)</article>").expect("article regex is valid")
});

/// First link to a post inside an article card.
#[allow(clippy::expect_used)]
static POST_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']*?/post/(\d+)[^"']*)["']"#)
        .expect("post link regex is valid")
});

/// Anchors pointing at full-resolution files under `/data/`.
#[allow(clippy::expect_used)]
static DATA_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\b[^>]*?\bhref\s*=\s*["']([^"']*/data/[^"']*)["']"#)
        .expect("data link regex is valid")
});

/// Path segments shorter than this are not used as suggested names.
const MIN_SEGMENT_NAME_CHARS: usize = 6;

/// Scrapes `{site}/{service}/user/{id}` catalog pages and post pages.
#[derive(Debug, Clone)]
pub struct HtmlAdapter {
    site: Url,
    service: String,
}

impl HtmlAdapter {
    /// Creates an adapter for `site` (e.g. `https://kemono.cr`) and
    /// `service` (e.g. `patreon`).
    #[must_use]
    pub fn new(site: Url, service: impl Into<String>) -> Self {
        Self {
            site,
            service: service.into(),
        }
    }
}

impl ExtractionAdapter for HtmlAdapter {
    fn name(&self) -> &'static str {
        "html"
    }

    fn catalog_url(&self, user_id: &str) -> Result<Url, ExtractError> {
        with_segments(&self.site, &[self.service.as_str(), "user", user_id])
    }

    fn post_url(&self, catalog: &Url, post_id: &str) -> Result<Url, ExtractError> {
        with_segments(catalog, &["post", post_id])
    }

    fn extract_posts(
        &self,
        page_url: &Url,
        offset: u64,
        body: &[u8],
    ) -> Result<Vec<Post>, ExtractError> {
        let html = String::from_utf8_lossy(body);
        let mut seen = HashSet::new();
        let mut posts = Vec::new();

        for article in ARTICLE_PATTERN.captures_iter(&html) {
            let Some(link) = POST_LINK_PATTERN.captures(&article[1]) else {
                trace!("article without post link");
                continue;
            };
            let post_id = link[2].to_string();
            if !seen.insert(post_id.clone()) {
                continue;
            }
            let href = unescape_entities(&link[1]);
            let source_url = page_url
                .join(&href)
                .map_err(|e| ExtractError::invalid_url(href.clone(), e))?;
            posts.push(Post {
                post_id,
                source_url: source_url.to_string(),
                discovered_at_offset: offset,
            });
        }

        debug!(offset, posts = posts.len(), "catalog page parsed");
        Ok(posts)
    }

    fn extract_assets(&self, post: &Post, body: &[u8]) -> Result<Vec<Asset>, ExtractError> {
        let html = String::from_utf8_lossy(body);
        let base = Url::parse(&post.source_url)
            .map_err(|e| ExtractError::invalid_url(post.source_url.clone(), e))?;

        let mut found = Vec::new();
        for link in DATA_LINK_PATTERN.captures_iter(&html) {
            let href = unescape_entities(&link[1]);
            let Ok(asset_url) = base.join(&href) else {
                debug!(href = %href, "skipping unresolvable data link");
                continue;
            };
            let suggested = suggested_name(&asset_url);
            found.push((asset_url.to_string(), suggested));
        }

        let assets = number_assets(&post.post_id, found);
        debug!(post_id = %post.post_id, assets = assets.len(), "post page parsed");
        Ok(assets)
    }
}

/// Appends path segments to `base`, dropping its query and fragment.
pub(super) fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, ExtractError> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| ExtractError::invalid_url(base.as_str(), "cannot be a base URL"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Suggested file name: the `f` query parameter, else a long enough last
/// path segment.
fn suggested_name(asset_url: &Url) -> Option<String> {
    if let Some((_, name)) = asset_url.query_pairs().find(|(key, _)| key == "f") {
        let name = name.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    let segment = asset_url.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment).ok()?;
    (decoded.chars().count() >= MIN_SEGMENT_NAME_CHARS).then(|| decoded.into_owned())
}

fn unescape_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
