//! Rate-limited, retrying fetches shared by the page walker and the workers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::constants::INTERRUPT_POLL_INTERVAL;
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy, TaskState};
use super::transport::{FetchedBody, Transport};
use super::FetchError;
use crate::config::MirrorConfig;
use crate::stats::LiveCounters;

/// How a retried operation ended.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    /// The operation succeeded on attempt `attempts`.
    Fetched {
        /// Value produced by the successful attempt.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Permanent failure, fatal failure or retries exhausted.
    Failed {
        /// Error from the last attempt.
        error: FetchError,
        /// Attempts made.
        attempts: u32,
        /// Final state: `PermanentFail` or `RetriesExhausted`.
        state: TaskState,
    },
    /// The run was interrupted before another attempt could start.
    Interrupted {
        /// Attempts made before the interrupt.
        attempts: u32,
    },
}

/// Bundles the transport with the run's pacing, retry policy and cancel flag.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
    live: Arc<LiveCounters>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Creates a fetcher for one run.
    #[must_use]
    pub fn new(
        config: &MirrorConfig,
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        interrupted: Arc<AtomicBool>,
        live: Arc<LiveCounters>,
    ) -> Self {
        Self {
            transport,
            rate_limiter,
            policy: RetryPolicy::from_config(config),
            timeout: config.timeout,
            interrupted,
            live,
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shared run counters.
    #[must_use]
    pub fn live(&self) -> &Arc<LiveCounters> {
        &self.live
    }

    /// Returns true once the run-wide cancel flag is raised.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Raises the run-wide cancel flag.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// GETs and buffers `url`, retrying per policy.
    pub async fn fetch(&self, url: &str) -> FetchOutcome<FetchedBody> {
        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        self.retrying(url, |_| {
            let transport = Arc::clone(&transport);
            let url = url.to_string();
            async move { transport.fetch(&url, timeout).await }
        })
        .await
    }

    /// Single HEAD-style size probe under a rate permit. Not retried.
    ///
    /// # Errors
    ///
    /// Returns the transport's [`FetchError`].
    pub async fn probe_length(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| FetchError::connection(url, e.to_string()))?;
        self.transport.probe_length(url, self.timeout).await
    }

    /// Runs `op` under a rate permit until it succeeds or the policy gives
    /// up. `op` receives the 1-based attempt number.
    ///
    /// Backoff sleeps end early when the cancel flag is raised.
    #[instrument(skip(self, op))]
    pub async fn retrying<T, F, Fut>(&self, url: &str, mut op: F) -> FetchOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut state = TaskState::Pending;

        loop {
            if self.is_interrupted() {
                return FetchOutcome::Interrupted {
                    attempts: state.attempt(),
                };
            }

            state = state.begin_attempt();
            let attempt = state.attempt();
            debug!(attempt, "attempting fetch");

            let permit = match self.rate_limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    return FetchOutcome::Failed {
                        error: FetchError::connection(url, e.to_string()),
                        attempts: attempt,
                        state: TaskState::PermanentFail,
                    };
                }
            };
            let result = op(attempt).await;
            drop(permit);

            let error = match result {
                Ok(value) => {
                    return FetchOutcome::Fetched {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            let (failure_type, decision) = self.policy.decide(&error, attempt, &self.rate_limiter);
            state = state.fail(failure_type, &decision);

            match decision {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    info!(
                        url,
                        attempt = next_attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying fetch"
                    );
                    self.live.add_retry();
                    if !pause(delay, &self.interrupted).await {
                        return FetchOutcome::Interrupted { attempts: attempt };
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "not retrying fetch");
                    return FetchOutcome::Failed {
                        error,
                        attempts: attempt,
                        state,
                    };
                }
            }
        }
    }
}

/// Sleeps for `delay`, waking early if `interrupted` is raised.
///
/// Returns false if the sleep was cut short.
pub async fn pause(delay: Duration, interrupted: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(INTERRUPT_POLL_INTERVAL)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::AcceptContentType;
    use std::sync::atomic::AtomicU32;

    fn fetcher(max_attempts: u32) -> Fetcher {
        let config = MirrorConfig::default();
        Fetcher {
            transport: Arc::new(NoTransport),
            rate_limiter: Arc::new(RateLimiter::disabled()),
            policy: RetryPolicy::new(
                max_attempts,
                Duration::from_secs(1),
                Duration::from_secs(60),
                2.0,
            )
            .with_jitter(Duration::ZERO),
            timeout: config.timeout,
            interrupted: Arc::new(AtomicBool::new(false)),
            live: Arc::new(LiveCounters::new()),
        }
    }

    struct NoTransport;

    #[async_trait::async_trait]
    impl Transport for NoTransport {
        async fn fetch(&self, url: &str, _: Duration) -> Result<FetchedBody, FetchError> {
            Err(FetchError::http_status(url, 404))
        }
        async fn fetch_to_file(
            &self,
            url: &str,
            _: Duration,
            _: &std::path::Path,
            _: &AcceptContentType,
        ) -> Result<super::super::Transfer, FetchError> {
            Err(FetchError::http_status(url, 404))
        }
        async fn probe_length(&self, _: &str, _: Duration) -> Result<Option<u64>, FetchError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_use_every_attempt_then_exhaust() {
        let fetcher = fetcher(4);
        let calls = AtomicU32::new(0);

        let outcome: FetchOutcome<()> = fetcher
            .retrying("https://k/a", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::http_status("https://k/a", 503)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            FetchOutcome::Failed {
                attempts, state, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(state, TaskState::RetriesExhausted);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fetcher.live().retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let fetcher = fetcher(3);
        let start = tokio::time::Instant::now();

        let _: FetchOutcome<()> = fetcher
            .retrying("https://k/a", |_| async {
                Err(FetchError::timeout("https://k/a"))
            })
            .await;

        // 1s + 2s
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let fetcher = fetcher(4);
        let outcome = fetcher.fetch("https://k/missing").await;
        match outcome {
            FetchOutcome::Failed {
                attempts,
                state,
                error,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(state, TaskState::PermanentFail);
                assert_eq!(error.status(), Some(404));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_reports_attempts() {
        let fetcher = fetcher(4);
        let outcome = fetcher
            .retrying("https://k/a", |attempt| async move {
                if attempt < 2 {
                    Err(FetchError::connection("https://k/a", "reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Fetched {
                value: 2,
                attempts: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cuts_backoff_short() {
        let fetcher = fetcher(4);
        let flag = Arc::clone(&fetcher.interrupted);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let start = tokio::time::Instant::now();
        let outcome: FetchOutcome<()> = fetcher
            .retrying("https://k/a", |_| async {
                Err(FetchError::timeout("https://k/a"))
            })
            .await;

        assert!(matches!(outcome, FetchOutcome::Interrupted { attempts: 1 }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
