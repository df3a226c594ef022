//! In-memory [`Transport`] with per-URL scripted replies.
//!
//! Each URL holds a queue of replies; the last one repeats forever. Unknown
//! URLs answer 404. Works under paused Tokio time.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::download::{AcceptContentType, FetchError, FetchedBody, Transfer, Transport};

/// One canned response.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 200 with a body.
    Body {
        /// Body bytes.
        bytes: Vec<u8>,
        /// Declared Content-Type.
        content_type: Option<String>,
        /// Declared Content-Length.
        declared_length: Option<u64>,
    },
    /// Non-success status.
    Status {
        /// HTTP status.
        status: u16,
        /// Retry-After header value.
        retry_after: Option<String>,
    },
    /// The request times out.
    Timeout,
    /// Writing the body fails with a full disk.
    DiskFull,
}

impl Reply {
    /// 200 with `bytes` and a matching Content-Length.
    pub fn body(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self::Body {
            declared_length: Some(bytes.len() as u64),
            bytes,
            content_type: None,
        }
    }

    /// 200 with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::body(serde_json::to_vec(value).unwrap())
    }

    /// 200 whose Content-Length promises more than the body holds.
    pub fn truncated(bytes: impl Into<Vec<u8>>, declared: u64) -> Self {
        Self::Body {
            bytes: bytes.into(),
            content_type: None,
            declared_length: Some(declared),
        }
    }

    /// Sets the Content-Type of a body reply.
    #[must_use]
    pub fn with_content_type(self, value: &str) -> Self {
        match self {
            Self::Body {
                bytes,
                declared_length,
                ..
            } => Self::Body {
                bytes,
                declared_length,
                content_type: Some(value.to_string()),
            },
            other => other,
        }
    }

    /// Bare status.
    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            retry_after: None,
        }
    }

    /// 429 with a Retry-After header.
    pub fn too_many_requests(retry_after: &str) -> Self {
        Self::Status {
            status: 429,
            retry_after: Some(retry_after.to_string()),
        }
    }

    fn into_body(self, url: &str) -> Result<FetchedBody, FetchError> {
        match self {
            Self::Body {
                bytes,
                content_type,
                declared_length,
            } => Ok(FetchedBody {
                bytes,
                content_length: declared_length,
                content_type,
            }),
            Self::Status {
                status,
                retry_after: Some(header),
            } => Err(FetchError::http_status_with_retry_after(url, status, Some(header))),
            Self::Status { status, .. } => Err(FetchError::http_status(url, status)),
            Self::Timeout => Err(FetchError::timeout(url)),
            Self::DiskFull => Err(FetchError::connection(url, "disk full reply on page fetch")),
        }
    }
}

/// Request method as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Buffered or streamed GET.
    Get,
    /// Size probe.
    Head,
}

/// One logged request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Requested URL.
    pub url: String,
    /// Method used.
    pub method: Method,
    /// When the request started.
    pub at: Instant,
}

/// Scripted transport.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<Request>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    /// Empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request takes `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Appends `reply` to the queue for `url`.
    pub fn route(&self, url: impl Into<String>, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(reply);
    }

    /// Drops any queued replies for `url` and answers with `reply` from now on.
    pub fn replace(&self, url: impl Into<String>, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.into(), VecDeque::from([reply]));
    }

    /// Every logged request.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// GETs made to `url`.
    pub fn get_count(&self, url: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url && r.method == Method::Get)
            .count()
    }

    /// Requests of any kind whose URL contains `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }

    /// Highest number of simultaneous requests seen.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::status(404)),
            None => Reply::status(404),
        }
    }

    fn peek_reply(&self, url: &str) -> Reply {
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .and_then(|queue| queue.front().cloned())
            .unwrap_or(Reply::status(404))
    }

    async fn begin(&self, url: &str, method: Method) -> InFlight<'_> {
        self.log.lock().unwrap().push(Request {
            url: url.to_string(),
            method,
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchedBody, FetchError> {
        let _guard = self.begin(url, Method::Get).await;
        self.next_reply(url).into_body(url)
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        _timeout: Duration,
        dest: &Path,
        accept: &AcceptContentType,
    ) -> Result<Transfer, FetchError> {
        let _guard = self.begin(url, Method::Get).await;
        let reply = self.next_reply(url);
        if matches!(reply, Reply::DiskFull) {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(FetchError::io(
                dest,
                std::io::Error::from(std::io::ErrorKind::StorageFull),
            ));
        }

        let body = reply.into_body(url)?;
        if !accept(body.content_type.as_deref()) {
            return Err(FetchError::unsupported_content_type(
                url,
                body.content_type.unwrap_or_default(),
            ));
        }
        if let Err(e) = tokio::fs::write(dest, &body.bytes).await {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(FetchError::io(dest, e));
        }
        Ok(Transfer {
            bytes_written: body.bytes.len() as u64,
            content_length: body.content_length,
        })
    }

    async fn probe_length(&self, url: &str, _timeout: Duration) -> Result<Option<u64>, FetchError> {
        let _guard = self.begin(url, Method::Head).await;
        self.peek_reply(url).into_body(url).map(|body| body.content_length)
    }
}
