//! Retry logic with exponential backoff for transient fetch failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying fetch errors and determining retry behavior, plus the
//! [`TaskState`] machine each asset transfer moves through.
//!
//! # Overview
//!
//! When a fetch fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::RateLimited`] - Server rate limiting (honors Retry-After)
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::Fatal`] - Local conditions that stop the whole run (disk full)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with jitter.
//!
//! # Example
//!
//! ```
//! use mirror_core::download::{
//!     FetchError, RetryPolicy, FailureType, RetryDecision, classify_error
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://kemono.cr/data/a.png", 503);
//! let failure_type = classify_error(&error);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use crate::config::MirrorConfig;

/// Default maximum retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (2 seconds).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default maximum delay cap (60 seconds).
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Default maximum jitter added to delays (500ms).
pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(500);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Classification of fetch failure types.
///
/// Used to determine whether a failed fetch should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection reset, truncated body.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, TLS failure, filtered content type.
    Permanent,

    /// Server rate limiting (HTTP 429).
    ///
    /// Retried; a Retry-After hint replaces the computed backoff.
    RateLimited,

    /// The run cannot continue (local disk full).
    Fatal,
}

impl FailureType {
    /// Returns true for failure types the policy may retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 4 (one attempt plus three retries)
/// - `base_delay`: 2 seconds
/// - `max_delay`: 60 seconds
/// - `backoff_multiplier`: 2.0
/// - `max_jitter`: 500 milliseconds
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
///
/// Jitter is only ever added, so the k-th retry never waits less than the
/// capped exponential value.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of the random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            base_delay: DEFAULT_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings and default jitter.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: DEFAULT_RETRY_JITTER,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Builds the policy described by a run configuration.
    ///
    /// `max_retries` counts retries, so the policy allows `max_retries + 1`
    /// attempts in total.
    #[must_use]
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            base_delay: config.retry_delay,
            max_delay: config.max_retry_delay.max(config.retry_delay),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: config.retry_jitter,
        }
    }

    /// Replaces the jitter bound. `Duration::ZERO` disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::Fatal => {
                return RetryDecision::DoNotRetry {
                    reason: "fatal local failure - run must stop".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Classifies `error` and decides, letting a 429 Retry-After hint replace
    /// the computed backoff.
    ///
    /// The hint is also recorded with the rate limiter so sustained throttling
    /// gets logged.
    pub fn decide(
        &self,
        error: &FetchError,
        attempt: u32,
        rate_limiter: &RateLimiter,
    ) -> (FailureType, RetryDecision) {
        let failure_type = classify_error(error);
        let retry_after = if failure_type == FailureType::RateLimited {
            extract_retry_after_delay(error, rate_limiter)
        } else {
            None
        };

        let decision = match self.should_retry(failure_type, attempt) {
            RetryDecision::Retry { delay, attempt } => RetryDecision::Retry {
                delay: retry_after.unwrap_or(delay),
                attempt,
            },
            other => other,
        };
        (failure_type, decision)
    }

    /// Backoff for the retry that follows failed attempt `attempt`.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Random jitter in `0..=max_jitter`, so assets that failed together do
    /// not retry together.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Parses the Retry-After hint carried by a rate-limited error.
///
/// Returns `None` if the error has no hint or it cannot be parsed.
fn extract_retry_after_delay(error: &FetchError, rate_limiter: &RateLimiter) -> Option<Duration> {
    let (url, header) = match error {
        FetchError::HttpStatus {
            url,
            retry_after: Some(header),
            ..
        } => (url, header),
        _ => return None,
    };

    let delay = parse_retry_after(header)?;
    rate_limiter.record_rate_limit(url, delay);

    debug!(
        url = %url,
        retry_after = %header,
        delay_ms = delay.as_millis(),
        "using Retry-After header delay"
    );

    Some(delay)
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 400-499 | Permanent | Client errors do not change on retry |
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | RateLimited | Rate limited - retry after hint |
/// | 500-599 | Transient | Server error - may be temporary |
///
/// # Non-HTTP Errors
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Network may recover |
/// | ConnectionFailed | Transient | Server may come back |
/// | Truncated | Transient | Stream cut mid-transfer |
/// | Tls | Permanent | Certificate/config issue |
/// | InvalidUrl | Permanent | Won't succeed |
/// | UnsupportedContentType | Permanent | Server keeps sending the same type |
/// | Io (disk full) | Fatal | Every further write fails too |
/// | Io (other) | Permanent | Local issue specific to this file |
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. }
        | FetchError::ConnectionFailed { .. }
        | FetchError::Truncated { .. } => FailureType::Transient,
        FetchError::Tls { .. }
        | FetchError::InvalidUrl { .. }
        | FetchError::UnsupportedContentType { .. } => FailureType::Permanent,
        FetchError::Io { .. } if error.is_storage_full() => FailureType::Fatal,
        FetchError::Io { .. } => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,   // Request Timeout
        429 => FailureType::RateLimited, // Too Many Requests

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        _ => FailureType::Permanent,
    }
}

/// Lifecycle of one asset transfer.
///
/// `Pending → Attempting(n) → Success | TransientFail(n) → Attempting(n+1) |
/// PermanentFail | RetriesExhausted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Admitted, not yet tried.
    Pending,
    /// Attempt `n` (1-indexed) in flight.
    Attempting(u32),
    /// Attempt `n` failed transiently; a retry is scheduled.
    TransientFail(u32),
    /// Transferred and verified.
    Success,
    /// Failed in a way retrying cannot fix.
    PermanentFail,
    /// Transient failures used up every allowed attempt.
    RetriesExhausted,
}

impl TaskState {
    /// Moves into the next attempt. Terminal states stay put.
    #[must_use]
    pub fn begin_attempt(self) -> Self {
        match self {
            Self::Pending => Self::Attempting(1),
            Self::TransientFail(n) => Self::Attempting(n + 1),
            other => other,
        }
    }

    /// Records a verified transfer.
    #[must_use]
    pub fn succeed(self) -> Self {
        match self {
            Self::Attempting(_) => Self::Success,
            other => other,
        }
    }

    /// Records a failed attempt given the policy's verdict.
    #[must_use]
    pub fn fail(self, failure_type: FailureType, decision: &RetryDecision) -> Self {
        let Self::Attempting(n) = self else {
            return self;
        };
        match decision {
            RetryDecision::Retry { .. } => Self::TransientFail(n),
            RetryDecision::DoNotRetry { .. } if failure_type.is_retryable() => {
                Self::RetriesExhausted
            }
            RetryDecision::DoNotRetry { .. } => Self::PermanentFail,
        }
    }

    /// Returns the current attempt number, or 0 before the first attempt.
    #[must_use]
    pub fn attempt(self) -> u32 {
        match self {
            Self::Attempting(n) | Self::TransientFail(n) => n,
            _ => 0,
        }
    }

    /// Returns true for `Success`, `PermanentFail` and `RetriesExhausted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::PermanentFail | Self::RetriesExhausted
        )
    }
}
