//! Site-specific extraction of posts and assets from fetched bodies.
//!
//! The crawl engine never parses markup itself. It asks an
//! [`ExtractionAdapter`] for URLs to fetch and hands back raw bodies; the
//! adapter turns them into [`Post`]s and [`Asset`]s.
//!
//! Two adapters ship with the crate:
//!
//! - [`HtmlAdapter`]: scrapes the public HTML pages
//! - [`JsonApiAdapter`]: reads the `/api/v1` JSON endpoints

mod html;
mod json;

pub use html::HtmlAdapter;
pub use json::JsonApiAdapter;

use thiserror::Error;
use url::Url;

use crate::model::{Asset, Post};

/// Query parameter carrying the catalog offset.
pub const OFFSET_PARAM: &str = "o";

/// Errors raised while building URLs or parsing bodies.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// A URL could not be built or parsed.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL or fragment.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The body was not in the expected format.
    #[error("malformed body from {url}: {reason}")]
    Malformed {
        /// Where the body came from.
        url: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ExtractError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a malformed body error.
    pub fn malformed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Converts fetched bodies into posts and assets for one site.
///
/// Implementations are pure: no I/O, no shared state.
pub trait ExtractionAdapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Catalog URL (offset 0) for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidUrl`] if the URL cannot be built.
    fn catalog_url(&self, user_id: &str) -> Result<Url, ExtractError>;

    /// URL of the catalog page at `offset`. The offset parameter is omitted
    /// for offset 0.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidUrl`] if the URL cannot be built.
    fn page_url(&self, catalog: &Url, offset: u64) -> Result<Url, ExtractError> {
        let mut url = catalog.clone();
        let retained: Vec<(String, String)> = catalog
            .query_pairs()
            .filter(|(key, _)| key != OFFSET_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.set_query(None);
        if !retained.is_empty() || offset > 0 {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &retained {
                pairs.append_pair(key, value);
            }
            if offset > 0 {
                pairs.append_pair(OFFSET_PARAM, &offset.to_string());
            }
        }
        Ok(url)
    }

    /// URL of a single post, for runs over explicit post IDs.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::InvalidUrl`] if the URL cannot be built.
    fn post_url(&self, catalog: &Url, post_id: &str) -> Result<Url, ExtractError>;

    /// Extracts the posts listed on a catalog page. An empty list means the
    /// catalog is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Malformed`] if the body cannot be read at all.
    fn extract_posts(&self, page_url: &Url, offset: u64, body: &[u8])
    -> Result<Vec<Post>, ExtractError>;

    /// Extracts the downloadable assets of one post, in page order with
    /// 1-based ordinals and without duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Malformed`] if the body cannot be read at all.
    fn extract_assets(&self, post: &Post, body: &[u8]) -> Result<Vec<Asset>, ExtractError>;
}

/// Numbers assets 1.. in order, dropping repeated URLs.
pub(crate) fn number_assets(
    post_id: &str,
    found: impl IntoIterator<Item = (String, Option<String>)>,
) -> Vec<Asset> {
    let mut seen = std::collections::HashSet::new();
    let mut assets = Vec::new();
    for (asset_url, suggested_name) in found {
        if !seen.insert(asset_url.clone()) {
            continue;
        }
        let ordinal = u32::try_from(assets.len() + 1).unwrap_or(u32::MAX);
        assets.push(Asset {
            asset_url,
            post_id: post_id.to_string(),
            ordinal,
            suggested_name,
        });
    }
    assets
}
