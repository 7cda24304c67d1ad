//! Artifact download over HTTP(S), with `file://` for local mirrors.

use crate::retry::RetryPolicy;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;
use url::Url;

/// Downloads artifacts by URL.
pub trait Fetcher {
    /// Fetch the full body at `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Errors from fetching an artifact.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("malformed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported URL scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },
    #[error("HTTP {code} from {url}")]
    Status { url: String, code: u16 },
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Transport failures, rate limits and server errors may clear up.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Fetches `http`, `https` and `file` URLs.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    user_agent: String,
    retry: RetryPolicy,
}

impl UrlFetcher {
    pub fn new() -> Self {
        Self {
            user_agent: format!(
                "fuzzenv/{} (+https://github.com/fuzzenv/fuzzenv)",
                env!("CARGO_PKG_VERSION")
            ),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for transient failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|()| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".to_string(),
                })?;
                std::fs::read(&path).map_err(|source| FetchError::Io { path, source })
            }
            "http" | "https" => {
                let response = ureq::get(url.as_str())
                    .set("User-Agent", &self.user_agent)
                    .call()
                    .map_err(|e| match e {
                        ureq::Error::Status(code, _) => FetchError::Status {
                            url: url.to_string(),
                            code,
                        },
                        ureq::Error::Transport(t) => FetchError::Transport {
                            url: url.to_string(),
                            reason: t.to_string(),
                        },
                    })?;

                let mut body = Vec::new();
                response
                    .into_reader()
                    .read_to_end(&mut body)
                    .map_err(|e| FetchError::Transport {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(body)
            }
            other => Err(FetchError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

impl Default for UrlFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for UrlFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let body = self
            .retry
            .run(url, |_| self.fetch_once(&parsed), FetchError::is_transient)?;
        debug!(%url, bytes = body.len(), "fetched");
        Ok(body)
    }
}
