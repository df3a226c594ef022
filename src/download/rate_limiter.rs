//! Global request pacing shared by the page walker and every download worker.
//!
//! This module provides the [`RateLimiter`] struct which bounds outbound
//! traffic against the single remote host a run talks to:
//!
//! - consecutive request starts are spaced at least `min_interval` apart
//! - at most `max_in_flight` requests are outstanding at once
//! - after every `batch_size` request starts, everyone waits `batch_pause`
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mirror_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(500), 30);
//!
//! // First request proceeds immediately
//! let permit = limiter.acquire().await.unwrap();
//! // ... fetch while holding the permit
//! drop(permit);
//!
//! // Second request starts no earlier than 500ms after the first
//! let _permit = limiter.acquire().await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Upper bound used when the limiter is disabled.
const UNBOUNDED_IN_FLIGHT: usize = Semaphore::MAX_PERMITS;

/// The limiter's semaphore was closed while a caller waited on it.
#[derive(Debug, Error)]
#[error("rate limiter closed")]
pub struct RateLimiterClosed;

/// Run-wide rate limiter.
///
/// Wrapped in `Arc` and shared across spawned Tokio tasks. Spacing state sits
/// behind a `tokio::sync::Mutex` so the read-wait-update sequence is atomic
/// and request starts are serialized.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum gap between consecutive request starts.
    min_interval: Duration,

    /// Whether pacing is disabled (tests, `--request-delay-ms 0`).
    disabled: bool,

    /// Start time of the previous request. `None` until the first request.
    last_request: Mutex<Option<Instant>>,

    /// Ceiling on outstanding requests.
    in_flight: Arc<Semaphore>,

    /// Pause every `batch_size` starts. `0` disables batch pauses.
    batch_size: u64,
    batch_pause: Duration,
    started: AtomicU64,

    /// Total delay imposed by Retry-After hints (milliseconds).
    cumulative_delay_ms: AtomicU64,
}

/// Proof that a request slot is held. Dropping it frees the slot.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateLimiter {
    /// Creates a limiter with the given spacing and in-flight ceiling.
    ///
    /// A zero `min_interval` disables spacing but keeps the ceiling.
    #[must_use]
    pub fn new(min_interval: Duration, max_in_flight: usize) -> Self {
        Self {
            min_interval,
            disabled: min_interval.is_zero(),
            last_request: Mutex::new(None),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            batch_size: 0,
            batch_pause: Duration::ZERO,
            started: AtomicU64::new(0),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a limiter that never delays and has no practical ceiling.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, UNBOUNDED_IN_FLIGHT)
    }

    /// Adds a pause of `pause` after every `batch_size` request starts.
    #[must_use]
    pub fn with_batch_pause(mut self, batch_size: usize, pause: Duration) -> Self {
        self.batch_size = batch_size as u64;
        self.batch_pause = pause;
        self
    }

    /// Returns true if spacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Waits for a free request slot and the next start time, then returns a
    /// permit to hold for the duration of the request.
    ///
    /// The slot is taken before the spacing lock so queued callers never hold
    /// a start time they cannot use.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimiterClosed`] if the in-flight semaphore was closed.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<RatePermit, RateLimiterClosed> {
        let slot = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| RateLimiterClosed)?;

        let mut last = self.last_request.lock().await;

        if !self.disabled {
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < self.min_interval {
                    let wait = self.min_interval - elapsed;
                    debug!(delay_ms = wait.as_millis(), "rate limiting request");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let started = self.started.fetch_add(1, Ordering::Relaxed) + 1;
        if self.batch_size > 0 && started % self.batch_size == 0 && !self.batch_pause.is_zero() {
            debug!(
                started,
                pause_ms = self.batch_pause.as_millis(),
                "batch pause"
            );
            tokio::time::sleep(self.batch_pause).await;
        }

        *last = Some(Instant::now());
        drop(last);

        Ok(RatePermit { _slot: slot })
    }

    /// Records a Retry-After delay imposed by the server and warns once the
    /// run-wide total crosses the threshold.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        let total_ms = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::Relaxed)
            .saturating_add(delay_ms);
        let total = Duration::from_millis(total_ms);

        if total >= CUMULATIVE_DELAY_WARNING_THRESHOLD
            && total - delay < CUMULATIVE_DELAY_WARNING_THRESHOLD
        {
            warn!(
                url,
                cumulative_secs = total.as_secs(),
                "server is rate limiting heavily; consider raising --request-delay-ms"
            );
        }
    }

    /// Total delay imposed by Retry-After hints so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Number of request starts granted so far.
    #[must_use]
    pub fn requests_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

/// Parses a Retry-After header value into a delay.
///
/// Accepts integer seconds or an HTTP-date. Values above one hour are capped,
/// negative values are ignored, and dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => {
            warn!(
                delay_secs = duration.as_secs(),
                max_secs = MAX_RETRY_AFTER.as_secs(),
                "Retry-After date exceeds maximum, capping at 1 hour"
            );
            Some(MAX_RETRY_AFTER)
        }
        Ok(duration) => Some(duration),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_new_zero_interval_is_disabled() {
        let limiter = RateLimiter::new(Duration::ZERO, 4);
        assert!(limiter.is_disabled());
        assert!(!RateLimiter::new(Duration::from_millis(1), 4).is_disabled());
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::disabled();
        let start = Instant::now();

        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }

        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.requests_started(), 3);
    }

    #[tokio::test]
    async fn test_rate_limiter_first_request_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1), 4);
        let start = Instant::now();

        let _permit = limiter.acquire().await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_consecutive_starts() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1), 4);
        let start = Instant::now();

        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(10));

        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));

        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rate_limiter_concurrent_callers_are_serialized() {
        tokio::time::pause();

        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500), 10));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                Instant::now()
            }));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_rate_limiter_in_flight_ceiling_blocks_until_release() {
        tokio::time::pause();

        let limiter = Arc::new(RateLimiter::new(Duration::ZERO, 1));
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rate_limiter_batch_pause_applies_every_batch() {
        tokio::time::pause();

        let limiter =
            RateLimiter::new(Duration::ZERO, 10).with_batch_pause(2, Duration::from_secs(3));
        let start = Instant::now();

        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(10));
        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(3));
        drop(limiter.acquire().await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_record_rate_limit_accumulates() {
        let limiter = RateLimiter::disabled();
        limiter.record_rate_limit("https://kemono.cr/a", Duration::from_secs(5));
        limiter.record_rate_limit("https://kemono.cr/b", Duration::from_secs(5));
        assert_eq!(limiter.cumulative_delay(), Duration::from_secs(10));
    }

    // ==================== Retry-After Parsing Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_zero() {
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_whitespace() {
        assert_eq!(parse_retry_after("  5  "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Expected ~60s, got {duration:?}"
        );
    }
}
