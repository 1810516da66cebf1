//! Resource fetching abstraction.
//!
//! The session only ever talks to an [`ImageFetcher`]; how bytes are
//! retrieved (HTTP, filesystem, a test stub) stays outside the core.
//! The default [`SystemFetcher`] shells out to the system `curl` binary
//! for http(s) URLs and reads `file:` URLs via `tokio::fs`, keeping the
//! crate free of an HTTP client dependency.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use url::Url;

use crate::error::{LabelkitError, LabelkitResult};

/// Raw bytes plus the content type, when the transport reports one.
#[derive(Clone, Debug)]
pub struct FetchedResource {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedResource {
    pub fn new(bytes: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            bytes,
            content_type,
        }
    }
}

pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub trait ImageFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> LocalBoxFuture<'a, LabelkitResult<FetchedResource>>;
}

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Fetcher backed by the system `curl` binary for http(s) and the
/// filesystem for `file:` URLs. `--fail` turns non-2xx responses into a
/// typed fetch failure.
#[derive(Clone, Debug)]
pub struct SystemFetcher {
    timeout: Duration,
}

impl Default for SystemFetcher {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl SystemFetcher {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn fetch_http(&self, url: &Url) -> LabelkitResult<FetchedResource> {
        let output = tokio::process::Command::new("curl")
            .arg("--silent")
            .arg("--show-error")
            .arg("--fail")
            .arg("--location")
            .arg("--max-time")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(url.as_str())
            .output()
            .await
            .map_err(|e| LabelkitError::resolution(format!("spawn curl for '{url}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(LabelkitError::resolution(if stderr.is_empty() {
                format!("fetch '{url}' failed ({})", output.status)
            } else {
                format!("fetch '{url}' failed: {stderr}")
            }));
        }

        Ok(FetchedResource::new(output.stdout, None))
    }

    async fn fetch_file(&self, url: &Url) -> LabelkitResult<FetchedResource> {
        let path = url
            .to_file_path()
            .map_err(|_| LabelkitError::resolution(format!("'{url}' is not a local file path")))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| LabelkitError::resolution(format!("read '{}': {e}", path.display())))?;
        Ok(FetchedResource::new(bytes, None))
    }
}

impl ImageFetcher for SystemFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> LocalBoxFuture<'a, LabelkitResult<FetchedResource>> {
        Box::pin(async move {
            match url.scheme() {
                "http" | "https" => self.fetch_http(url).await,
                "file" => self.fetch_file(url).await,
                other => Err(LabelkitError::resolution(format!(
                    "unsupported URL scheme '{other}' in '{url}'"
                ))),
            }
        })
    }
}
