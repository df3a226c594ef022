//! Error types for network fetches and file transfers.
//!
//! Every failure a [`Transport`](super::Transport) can report is a
//! [`FetchError`]. The scheduler and walker classify these into retryable and
//! permanent failures (see [`classify_error`](super::classify_error)); the
//! user-facing [`FailureKind`](crate::FailureKind) is derived with
//! [`FetchError::kind`].

use std::path::PathBuf;

use thiserror::Error;

use crate::model::FailureKind;

/// Errors that can occur while fetching a page or transferring an asset.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Connection-level failure (DNS, refused, reset, body stream aborted).
    #[error("connection failed for {url}: {detail}")]
    ConnectionFailed {
        /// The URL that failed.
        url: String,
        /// Description of the underlying error.
        detail: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// TLS handshake or certificate validation failure.
    #[error("TLS error fetching {url}: {detail}")]
    Tls {
        /// The URL that failed.
        url: String,
        /// Description of the underlying error.
        detail: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Body ended before the declared Content-Length was reached.
    #[error("truncated transfer from {url}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Truncated {
        /// The URL being transferred.
        url: String,
        /// Declared size in bytes.
        expected_bytes: u64,
        /// Bytes actually received.
        actual_bytes: u64,
    },

    /// Response declared a content type the asset filter rejects.
    #[error("unsupported content type {content_type} for {url}")]
    UnsupportedContentType {
        /// The URL being transferred.
        url: String,
        /// The rejected content type.
        content_type: String,
    },

    /// File system error (create directory, write, rename).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a connection failure.
    pub fn connection(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a TLS error.
    pub fn tls(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Tls {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a truncation error.
    pub fn truncated(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an unsupported content type error.
    pub fn unsupported_content_type(
        url: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self::UnsupportedContentType {
            url: url.into(),
            content_type: content_type.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the local disk ran out of space.
    ///
    /// Disk exhaustion stops the whole run instead of failing one asset.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Io { source, .. } => {
                source.kind() == std::io::ErrorKind::StorageFull
                    || source.raw_os_error() == Some(ENOSPC)
            }
            _ => false,
        }
    }

    /// Returns the HTTP status code for status errors.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Maps the error onto the coarse kind recorded in results and summaries.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::ConnectionFailed { .. } => FailureKind::Connection,
            Self::HttpStatus { status, .. } => FailureKind::HttpStatus(*status),
            Self::Tls { .. } => FailureKind::Tls,
            Self::InvalidUrl { .. } => FailureKind::InvalidUrl,
            Self::Truncated { .. } => FailureKind::Truncated,
            Self::UnsupportedContentType { .. } => FailureKind::UnsupportedContentType,
            Self::Io { .. } => FailureKind::Filesystem,
        }
    }
}

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs a
// url or path that the source error does not carry.
