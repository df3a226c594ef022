//! Constants for the download module (timeouts, rate limiting, defaults).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Warning threshold for cumulative rate limit delay across a run (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Poll interval used when racing waits against the interrupt flag.
pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Suffix appended to a file name while its body is still streaming.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Browser User-Agent sent by default. Kemono rejects obvious bot agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
