//! Network plumbing for page fetches and asset transfers.
//!
//! # Features
//!
//! - [`Transport`] seam with a reqwest implementation ([`HttpTransport`])
//! - Streaming transfers to disk (memory-efficient for large files)
//! - Run-wide pacing and in-flight ceiling ([`RateLimiter`])
//! - Failure classification and exponential backoff ([`RetryPolicy`])
//! - Deterministic, filesystem-safe file naming
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use mirror_core::MirrorConfig;
//! use mirror_core::download::{HttpTransport, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new(&MirrorConfig::default())?;
//! let transfer = transport
//!     .fetch_to_file(
//!         "https://n1.kemono.cr/data/ab/cd/hash.png",
//!         Duration::from_secs(30),
//!         Path::new("./hash.png.part"),
//!         &|_| true,
//!     )
//!     .await?;
//! println!("Downloaded {} bytes", transfer.bytes_written);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod fetcher;
pub mod filename;
pub mod rate_limiter;
mod retry;
mod transport;

pub use client::HttpTransport;
pub use error::FetchError;
pub use fetcher::{FetchOutcome, Fetcher, pause};
pub use filename::{MediaCategory, plan_post_file_names, sanitize_filename};
pub use rate_limiter::{RateLimiter, RateLimiterClosed, RatePermit, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, TaskState, classify_error,
};
pub use transport::{AcceptContentType, FetchedBody, Transfer, Transport};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, FetchError>` explicitly in function signatures.
