//! Shared HTTP transport
//!
//! One connection-pooled client serves every handler. The transport
//! enforces the per-host concurrency cap, streams large bodies to disk and
//! reports structured errors that the retry policy can classify. It never
//! retries on its own; retry is a policy layered above.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, RETRY_AFTER};
use reqwest::{Client, Response};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GlobalSettings;

/// Suffix for in-flight downloads; a completed file never carries it
pub const PART_SUFFIX: &str = ".part";

/// Structured transport failure
///
/// The retriable/fatal split drives the retry policy: transient network
/// conditions retry, protocol-level rejections do not.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("TLS failure for {url}: {reason}")]
    Tls { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: u16,
        /// Server-requested delay, from a Retry-After header
        retry_after: Option<Duration>,
    },

    #[error("truncated body from {url}: received {received} of {expected} bytes")]
    Truncated {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("unusable response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("I/O error for {url}: {reason}")]
    Io { url: String, reason: String },

    #[error("circuit breaker open for {host}")]
    BreakerOpen { host: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether the retry policy should attempt the operation again
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Connect { .. }
            | TransportError::Timeout { .. }
            | TransportError::Truncated { .. }
            | TransportError::BreakerOpen { .. } => true,
            TransportError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            },
            TransportError::Tls { .. }
            | TransportError::Decode { .. }
            | TransportError::Io { .. }
            | TransportError::Cancelled => false,
        }
    }

    /// Delay requested by the server, if any (429 with Retry-After)
    pub fn server_delay(&self) -> Option<Duration> {
        match self {
            TransportError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return TransportError::Timeout {
                url: url.to_string(),
            };
        }
        let reason = source_chain(&e);
        // reqwest surfaces certificate problems as connect errors; the
        // distinction matters because TLS failures must not be retried.
        let lowered = reason.to_lowercase();
        if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
            return TransportError::Tls {
                url: url.to_string(),
                reason,
            };
        }
        TransportError::Connect {
            url: url.to_string(),
            reason,
        }
    }
}

fn source_chain(e: &reqwest::Error) -> String {
    use std::error::Error as _;
    let mut parts = vec![e.to_string()];
    let mut current: Option<&(dyn std::error::Error + 'static)> = e.source();
    while let Some(src) = current {
        parts.push(src.to_string());
        current = src.source();
    }
    parts.join(": ")
}

/// Shared HTTP client with per-host concurrency gating
pub struct HttpTransport {
    client: Client,
    /// Relaxed-verification client, used only for configured trusted hosts
    relaxed_client: Option<Client>,
    trusted_hosts: Vec<String>,
    host_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_host: usize,
    chunk_size: usize,
}

impl HttpTransport {
    pub fn new(settings: &GlobalSettings) -> anyhow::Result<Self> {
        let user_agent = concat!("geostage/", env!("CARGO_PKG_VERSION"));
        let builder = || {
            Client::builder()
                .user_agent(user_agent)
                .timeout(settings.retry.request_timeout())
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(settings.per_host_concurrency)
        };

        let client = builder().build()?;
        let relaxed_client = if settings.security.trusted_hosts.is_empty() {
            None
        } else {
            Some(builder().danger_accept_invalid_certs(true).build()?)
        };

        Ok(Self {
            client,
            relaxed_client,
            trusted_hosts: settings.security.trusted_hosts.clone(),
            host_slots: Mutex::new(HashMap::new()),
            per_host: settings.per_host_concurrency.max(1),
            chunk_size: settings.processing.chunk_size,
        })
    }

    fn client_for(&self, url: &Url) -> &Client {
        if let (Some(relaxed), Some(host)) = (&self.relaxed_client, url.host_str()) {
            if self.trusted_hosts.iter().any(|h| h == host) {
                return relaxed;
            }
        }
        &self.client
    }

    /// Acquire the per-host slot for a URL, waiting if the host is busy
    async fn acquire_host_slot(
        &self,
        url: &Url,
    ) -> tokio::sync::OwnedSemaphorePermit {
        let host = url.host_str().unwrap_or("-").to_string();
        let semaphore = {
            let mut slots = self.host_slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
                .clone()
        };
        // The semaphore is never closed while the transport lives.
        semaphore
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("host semaphore closed"))
    }

    /// Send a GET holding the per-host slot; the returned permit must stay
    /// alive until the body has been fully consumed.
    async fn send_get(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        params: &[(String, String)],
        accept: Option<&str>,
    ) -> Result<(tokio::sync::OwnedSemaphorePermit, Response), TransportError> {
        let slot = self.acquire_host_slot(url).await;
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut request = self.client_for(url).get(url.clone());
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = request.send() => {
                result.map_err(|e| TransportError::from_reqwest(url.as_str(), e))?
            },
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(TransportError::Status {
                url: url.as_str().to_string(),
                status: status.as_u16(),
                retry_after,
            });
        }
        Ok((slot, response))
    }

    /// GET a JSON document. Returns the final URL (after redirects) so
    /// callers can resolve relative hypermedia links against it.
    pub async fn get_json(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        params: &[(String, String)],
    ) -> Result<(Url, serde_json::Value), TransportError> {
        let (_slot, response) = self
            .send_get(cancel, url, params, Some("application/geo+json, application/json;q=0.9"))
            .await?;
        let final_url = response.url().clone();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = response.text() => {
                result.map_err(|e| TransportError::from_reqwest(url.as_str(), e))?
            },
        };
        let value = serde_json::from_str(&body).map_err(|e| TransportError::Decode {
            url: url.as_str().to_string(),
            reason: e.to_string(),
        })?;
        Ok((final_url, value))
    }

    /// GET a text document (feed XML)
    pub async fn get_text(
        &self,
        cancel: &CancellationToken,
        url: &Url,
    ) -> Result<String, TransportError> {
        let (_slot, response) = self.send_get(cancel, url, &[], None).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = response.text() => {
                result.map_err(|e| TransportError::from_reqwest(url.as_str(), e))
            },
        }
    }

    /// Download a resource to `dest_dir/<stem><ext>`, streaming in chunks.
    ///
    /// The extension comes from Content-Disposition first, the URL path
    /// second, the caller's hint third and `.data` as a last resort. The
    /// body streams to a `.part` sibling which is renamed into place only
    /// on completion; cancellation leaves the `.part` file for the next
    /// run to reclaim.
    pub async fn download_to_file(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        params: &[(String, String)],
        dest_dir: &Path,
        stem: &str,
        ext_hint: Option<&str>,
    ) -> Result<PathBuf, TransportError> {
        let io_err = |e: std::io::Error| TransportError::Io {
            url: url.as_str().to_string(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(dest_dir).await.map_err(io_err)?;

        let (_slot, response) = self.send_get(cancel, url, params, None).await?;
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expected_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let ext = infer_extension(disposition.as_deref(), response.url(), ext_hint);
        let file_name = format!("{}{}", stem, ext);
        let dest = dest_dir.join(&file_name);
        let part = dest_dir.join(format!("{}{}", file_name, PART_SUFFIX));

        if let Some(total) = expected_len {
            info!(file = %file_name, bytes = total, size = %format_bytes(total), "Downloading");
        } else {
            info!(file = %file_name, "Downloading");
        }

        let file = tokio::fs::File::create(&part).await.map_err(io_err)?;
        let mut writer = tokio::io::BufWriter::with_capacity(self.chunk_size, file);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    // Keep the .part file so a later run can resume cleanly.
                    let _ = writer.flush().await;
                    debug!(file = %file_name, "Download cancelled, keeping partial file");
                    return Err(TransportError::Cancelled);
                },
                next = stream.next() => next,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    received += bytes.len() as u64;
                    writer.write_all(&bytes).await.map_err(io_err)?;
                },
                Some(Err(e)) => {
                    return Err(TransportError::from_reqwest(url.as_str(), e));
                },
                None => break,
            }
        }
        writer.flush().await.map_err(io_err)?;
        drop(writer);

        if let Some(expected) = expected_len {
            if received < expected {
                warn!(file = %file_name, received, expected, "Body shorter than Content-Length");
                return Err(TransportError::Truncated {
                    url: url.as_str().to_string(),
                    expected,
                    received,
                });
            }
        }

        tokio::fs::rename(&part, &dest).await.map_err(io_err)?;
        info!(file = %file_name, size = %format_bytes(received), "Download complete");
        Ok(dest)
    }
}

/// Resolve the file extension for a download
pub fn infer_extension(disposition: Option<&str>, final_url: &Url, hint: Option<&str>) -> String {
    if let Some(name) = disposition.and_then(filename_from_disposition) {
        if let Some(ext) = extension_of(&name) {
            return ext;
        }
    }
    if let Some(segment) = final_url.path_segments().and_then(|mut s| s.next_back()) {
        if let Some(ext) = extension_of(&percent_decode(segment)) {
            return ext;
        }
    }
    if let Some(hint) = hint {
        let trimmed = hint.trim_start_matches('.');
        if !trimmed.is_empty() {
            return format!(".{}", trimmed.to_lowercase());
        }
    }
    ".data".to_string()
}

/// Parse a filename out of a Content-Disposition header value.
///
/// Handles `filename="name.ext"`, bare `filename=name.ext` and the RFC
/// 5987 `filename*=UTF-8''name.ext` variant.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = strip_prefix_ci(part, "filename*=") {
            let rest = rest.trim_start_matches("UTF-8''").trim_start_matches("utf-8''");
            let decoded = percent_decode(rest.trim_matches('"'));
            if !decoded.is_empty() {
                return Some(decoded);
            }
        } else if let Some(rest) = strip_prefix_ci(part, "filename=") {
            let decoded = percent_decode(rest.trim_matches('"'));
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }
    None
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

fn extension_of(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    let ext = &name[idx..];
    // Guard against dots inside path-like names with no real extension.
    if ext.len() > 1 && ext.len() <= 8 && !ext[1..].contains('/') {
        Some(ext.to_lowercase())
    } else {
        None
    }
}

/// Decode %XX escapes, leaving malformed escapes untouched
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_disposition_quoted() {
        let name = filename_from_disposition(r#"attachment; filename="data.zip""#);
        assert_eq!(name.as_deref(), Some("data.zip"));
    }

    #[test]
    fn test_filename_from_disposition_utf8() {
        let name =
            filename_from_disposition("attachment; filename*=UTF-8''l%C3%A4mningar.gpkg");
        assert_eq!(name.as_deref(), Some("lämningar.gpkg"));
    }

    #[test]
    fn test_filename_from_disposition_bare() {
        let name = filename_from_disposition("attachment; filename=plain.geojson");
        assert_eq!(name.as_deref(), Some("plain.geojson"));
    }

    #[test]
    fn test_infer_extension_priority() {
        let url = Url::parse("https://host/path/data.gpkg").unwrap();
        // Content-Disposition wins over the URL path.
        assert_eq!(
            infer_extension(Some(r#"attachment; filename="x.zip""#), &url, Some("gpkg")),
            ".zip"
        );
        // URL path wins over the hint.
        assert_eq!(infer_extension(None, &url, Some("zip")), ".gpkg");
        // Hint when the URL has no extension.
        let bare = Url::parse("https://host/download").unwrap();
        assert_eq!(infer_extension(None, &bare, Some("zip")), ".zip");
        // Last resort.
        assert_eq!(infer_extension(None, &bare, None), ".data");
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("l%C3%A4n"), "län");
        assert_eq!(percent_decode("no_escapes"), "no_escapes");
        assert_eq!(percent_decode("broken%2"), "broken%2");
    }

    #[test]
    fn test_retriable_classification() {
        let retriable = TransportError::Status {
            url: "u".into(),
            status: 503,
            retry_after: None,
        };
        assert!(retriable.is_retriable());
        let too_many = TransportError::Status {
            url: "u".into(),
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
        };
        assert!(too_many.is_retriable());
        assert_eq!(too_many.server_delay(), Some(Duration::from_secs(7)));
        let fatal = TransportError::Status {
            url: "u".into(),
            status: 404,
            retry_after: None,
        };
        assert!(!fatal.is_retriable());
        assert!(!TransportError::Cancelled.is_retriable());
        assert!(TransportError::BreakerOpen { host: "h".into() }.is_retriable());
        let tls = TransportError::Tls {
            url: "u".into(),
            reason: "certificate".into(),
        };
        assert!(!tls.is_retriable());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
