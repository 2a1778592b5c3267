//! Fetching artifacts for the chunked cache and captured resources as text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderValue, PRAGMA};
use resilink_core::error::FetchError;
use tracing::{debug, warn};

/// Length of the body excerpt kept on a non-success status.
const PREVIEW_CHARS: usize = 300;

/// Source of artifact bytes and resource text.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// GET a remote resource as text. Only http(s); no credentials are
    /// attached.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Fetches over HTTP(S) with caching disabled; `file://` URLs are read from
/// disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(120))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/pdf,*/*"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP client configuration rejected, using defaults");
                reqwest::Client::new()
            });

        Self { client }
    }

    async fn fetch_file(url: &Url) -> Result<Vec<u8>, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::Io(format!("{}: {e}", path.display())))
    }

    async fn fetch_http(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Turn a non-success response into [`FetchError::Http`] with the start of
/// its body.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::Http {
        status: status.as_u16(),
        preview: body.chars().take(PREVIEW_CHARS).collect(),
    })
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

        let bytes = match parsed.scheme() {
            "file" => Self::fetch_file(&parsed).await?,
            "http" | "https" => self.fetch_http(parsed).await?,
            _ => return Err(FetchError::InvalidUrl(url.to_string())),
        };

        debug!(url, bytes = bytes.len(), "Artifact fetched");
        Ok(bytes)
    }

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        // The client has no cookie store, so nothing but the signed URL goes out
        let response = self
            .client
            .get(parsed)
            .header(ACCEPT, "*/*")
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let text = check_status(response)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        debug!(url, chars = text.len(), "Resource text fetched");
        Ok(text)
    }
}
