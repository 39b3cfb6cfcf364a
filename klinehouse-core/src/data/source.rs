//! Archive source trait and the HTTP implementation.
//!
//! The `ArchiveSource` trait abstracts the transport so the fetcher can be
//! driven by an in-memory source in tests. Sources know nothing about the
//! cache, retries or checksums: one call is one GET.

use std::io::Read;
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancellationToken;

const READ_CHUNK: usize = 64 * 1024;

/// Errors from a single GET.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    /// Connection failures, server errors and rate limiting are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Network(_) => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 429,
            SourceError::NotFound { .. } | SourceError::Cancelled => false,
        }
    }
}

/// A place archives can be downloaded from.
pub trait ArchiveSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Download the full body at `url`. Implementations should give up with
    /// `SourceError::Cancelled` once `cancel` is set.
    fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, SourceError>;
}

/// Blocking HTTP source backed by reqwest.
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("klinehouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ArchiveSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }

        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut body = Vec::with_capacity(resp.content_length().unwrap_or(0) as usize);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let n = resp
                .read(&mut buf)
                .map_err(|e| SourceError::Network(format!("reading body of {url}: {e}")))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        Ok(body)
    }
}
