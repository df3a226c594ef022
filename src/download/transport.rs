//! The network seam between the crawl engine and the outside world.
//!
//! The walker and workers only ever talk to a [`Transport`]. Production code
//! uses [`HttpTransport`](super::HttpTransport); tests substitute an in-memory
//! implementation so runs can execute under paused Tokio time.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::FetchError;

/// A fully buffered response body (catalog and post pages).
#[derive(Debug, Clone, Default)]
pub struct FetchedBody {
    /// Raw body bytes.
    pub bytes: Vec<u8>,
    /// Declared Content-Length, when the server sent one.
    pub content_length: Option<u64>,
    /// Declared Content-Type, when the server sent one.
    pub content_type: Option<String>,
}

/// Metadata of a body streamed to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes actually written.
    pub bytes_written: u64,
    /// Declared Content-Length, when the server sent one.
    pub content_length: Option<u64>,
}

/// Content-Type gate passed to [`Transport::fetch_to_file`].
pub type AcceptContentType = dyn for<'a> Fn(Option<&'a str>) -> bool + Send + Sync;

/// Fetches pages and streams assets.
///
/// Implementations must be cheap to share behind an `Arc` and must not retry
/// on their own; retry policy belongs to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GETs `url` and buffers the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for network failures and non-success statuses.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBody, FetchError>;

    /// GETs `url` and streams the body into `dest`, creating or truncating it.
    ///
    /// `accept` sees the response's Content-Type before any byte is written;
    /// returning `false` aborts with [`FetchError::UnsupportedContentType`].
    /// `timeout` bounds the wait for the response head and then for each body
    /// chunk, not the whole transfer. On any error `dest` is removed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for network, status and filesystem failures.
    async fn fetch_to_file(
        &self,
        url: &str,
        timeout: Duration,
        dest: &Path,
        accept: &AcceptContentType,
    ) -> Result<Transfer, FetchError>;

    /// Asks the server for the size of `url` without fetching the body.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the server cannot be asked.
    async fn probe_length(&self, url: &str, timeout: Duration) -> Result<Option<u64>, FetchError>;
}
