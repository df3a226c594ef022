//! Adapter for the `/api/v1` JSON endpoints.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::html::with_segments;
use super::{ExtractError, ExtractionAdapter, number_assets};
use crate::model::{Asset, Post};

/// Reads `{site}/api/v1/{service}/user/{id}/posts` and
/// `{site}/api/v1/{service}/user/{id}/post/{post_id}`.
#[derive(Debug, Clone)]
pub struct JsonApiAdapter {
    site: Url,
    service: String,
    data_base: String,
}

/// Post ids arrive as strings from current servers and as numbers from
/// older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostId {
    Text(String),
    Number(u64),
}

impl PostId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListedPost {
    id: PostId,
}

#[derive(Debug, Default, Deserialize)]
struct FileRef {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostBody {
    #[serde(default)]
    file: Option<FileRef>,
    #[serde(default)]
    attachments: Vec<FileRef>,
}

/// The single-post endpoint wraps the post in `{"post": ...}`; the listing
/// embeds it bare.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostEnvelope {
    Wrapped { post: PostBody },
    Bare(PostBody),
}

impl JsonApiAdapter {
    /// Creates an adapter for `site` and `service`. Files are served from
    /// `{site}/data`.
    #[must_use]
    pub fn new(site: Url, service: impl Into<String>) -> Self {
        let data_base = format!("{}/data", site.as_str().trim_end_matches('/'));
        Self {
            site,
            service: service.into(),
            data_base,
        }
    }

    /// Overrides the host files are served from.
    #[must_use]
    pub fn with_data_base(mut self, data_base: &Url) -> Self {
        self.data_base = data_base.as_str().trim_end_matches('/').to_string();
        self
    }

    fn file_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.data_base)
        } else {
            format!("{}/{path}", self.data_base)
        }
    }
}

impl ExtractionAdapter for JsonApiAdapter {
    fn name(&self) -> &'static str {
        "api"
    }

    fn catalog_url(&self, user_id: &str) -> Result<Url, ExtractError> {
        with_segments(
            &self.site,
            &["api", "v1", self.service.as_str(), "user", user_id, "posts"],
        )
    }

    fn post_url(&self, catalog: &Url, post_id: &str) -> Result<Url, ExtractError> {
        let mut url = catalog.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| ExtractError::invalid_url(catalog.as_str(), "cannot be a base URL"))?
            .pop_if_empty()
            .pop()
            .extend(["post", post_id]);
        Ok(url)
    }

    fn extract_posts(
        &self,
        page_url: &Url,
        offset: u64,
        body: &[u8],
    ) -> Result<Vec<Post>, ExtractError> {
        let listed: Vec<ListedPost> = serde_json::from_slice(body)
            .map_err(|e| ExtractError::malformed(page_url.as_str(), e))?;

        let mut seen = std::collections::HashSet::new();
        let mut posts = Vec::with_capacity(listed.len());
        for item in listed {
            let post_id = item.id.into_string();
            if !seen.insert(post_id.clone()) {
                continue;
            }
            let source_url = self.post_url(page_url, &post_id)?;
            posts.push(Post {
                post_id,
                source_url: source_url.to_string(),
                discovered_at_offset: offset,
            });
        }

        debug!(offset, posts = posts.len(), "catalog page decoded");
        Ok(posts)
    }

    fn extract_assets(&self, post: &Post, body: &[u8]) -> Result<Vec<Asset>, ExtractError> {
        let envelope: PostEnvelope = serde_json::from_slice(body)
            .map_err(|e| ExtractError::malformed(post.source_url.as_str(), e))?;
        let post_body = match envelope {
            PostEnvelope::Wrapped { post } | PostEnvelope::Bare(post) => post,
        };

        let found = post_body
            .file
            .into_iter()
            .chain(post_body.attachments)
            .filter_map(|file| {
                let path = file.path.filter(|p| !p.trim().is_empty())?;
                let name = file.name.filter(|n| !n.trim().is_empty());
                Some((self.file_url(&path), name))
            });

        let assets = number_assets(&post.post_id, found);
        debug!(post_id = %post.post_id, assets = assets.len(), "post decoded");
        Ok(assets)
    }
}
