//! reqwest-backed [`Transport`] used for real runs.
//!
//! One client is built per run and shared by the walker and every worker so
//! connections are pooled.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::FetchError;
use super::constants::CONNECT_TIMEOUT_SECS;
use super::transport::{AcceptContentType, FetchedBody, Transfer, Transport};
use crate::config::MirrorConfig;

/// HTTP transport with connection pooling and gzip support.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use mirror_core::MirrorConfig;
/// use mirror_core::download::{HttpTransport, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpTransport::new(&MirrorConfig::default())?;
/// let page = transport
///     .fetch("https://kemono.cr/patreon/user/1", Duration::from_secs(30))
///     .await?;
/// println!("{} bytes", page.bytes.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a transport from the run configuration (user agent, TLS
    /// verification).
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be set up.
    pub fn new(config: &MirrorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .user_agent(config.user_agent.as_str())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        if !config.verify_ssl {
            warn!("TLS certificate verification disabled");
        }
        Ok(Self { client })
    }

    async fn send_request(
        &self,
        head: bool,
        url: &str,
        deadline: Deadline,
    ) -> Result<reqwest::Response, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        let request = if head {
            self.client.head(parsed)
        } else {
            self.client.get(parsed)
        };

        let response = match deadline {
            Deadline::Whole(timeout) => request
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| map_reqwest_error(url, &e))?,
            Deadline::Idle(timeout) => tokio::time::timeout(timeout, request.send())
                .await
                .map_err(|_| FetchError::timeout(url))?
                .map_err(|e| map_reqwest_error(url, &e))?,
        };

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status_code,
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// How a request's timeout is applied.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    /// Covers the whole exchange, body included. Used for pages and probes.
    Whole(Duration),
    /// Covers the response head and then each body chunk separately, so a
    /// large file that keeps arriving is never cut off.
    Idle(Duration),
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBody, FetchError> {
        let response = self
            .send_request(false, url, Deadline::Whole(timeout))
            .await?;
        let content_length = header_content_length(response.headers());
        let content_type = header_content_type(response.headers());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(url, &e))?;

        debug!(bytes = bytes.len(), "page fetched");
        Ok(FetchedBody {
            bytes: bytes.to_vec(),
            content_length,
            content_type,
        })
    }

    #[instrument(skip(self, accept), fields(url = %url, dest = %dest.display()))]
    async fn fetch_to_file(
        &self,
        url: &str,
        timeout: Duration,
        dest: &Path,
        accept: &AcceptContentType,
    ) -> Result<Transfer, FetchError> {
        let response = self
            .send_request(false, url, Deadline::Idle(timeout))
            .await?;
        let content_length = header_content_length(response.headers());
        let content_type = header_content_type(response.headers());

        if !accept(content_type.as_deref()) {
            return Err(FetchError::unsupported_content_type(
                url,
                content_type.unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        let mut file = File::create(dest)
            .await
            .map_err(|e| FetchError::io(dest, e))?;

        match stream_to_file(&mut file, response, url, dest, timeout).await {
            Ok(bytes_written) => {
                debug!(bytes_written, "transfer complete");
                Ok(Transfer {
                    bytes_written,
                    content_length,
                })
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(dest).await {
                    debug!(error = %cleanup, "could not remove partial file");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn probe_length(&self, url: &str, timeout: Duration) -> Result<Option<u64>, FetchError> {
        let response = self
            .send_request(true, url, Deadline::Whole(timeout))
            .await?;
        Ok(header_content_length(response.headers()))
    }
}

/// Streams response body to file, returning bytes written. Fails with a
/// timeout when no chunk arrives within `idle`.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    idle: Duration,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let next = tokio::time::timeout(idle, stream.next())
            .await
            .map_err(|_| FetchError::timeout(url))?;
        let Some(chunk_result) = next else {
            break;
        };
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, &e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(file_path, e))?;

    Ok(bytes_written)
}

fn map_reqwest_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else if is_tls_error(error) {
        FetchError::tls(url, error.to_string())
    } else if error.is_builder() {
        FetchError::invalid_url(url)
    } else {
        FetchError::connection(url, error_chain(error))
    }
}

/// reqwest does not expose TLS failures as a kind; they only show up in the
/// source chain text. The top-level message is skipped since it embeds the URL.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let mut error_string = String::new();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        error_string.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

// Read from the header rather than `Response::content_length`, which reports
// the body size hint (zero for HEAD).
fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}
