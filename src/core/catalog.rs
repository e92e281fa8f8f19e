//! Video catalog client: the upstream platform API boundary
//!
//! The orchestration core only needs two operations from the platform:
//! metadata lookup and a byte stream for the media itself. Both are behind
//! the `VideoCatalogClient` trait so tests and alternative backends can
//! stand in for the real HTTP client.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::core::error_handling::{errors, FetchError, FetchErrorKind};
use crate::core::models::{AppError, AppResult, DownloadConfig, VideoMetadata};

/// Chunked media bytes with fetch errors already categorized
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Narrow interface to the third-party video platform
#[async_trait]
pub trait VideoCatalogClient: Send + Sync {
    /// Fetch platform metadata for a video id
    async fn fetch_metadata(&self, video_id: &str) -> Result<VideoMetadata, FetchError>;

    /// Open the media byte stream. Returns the stream plus the total length
    /// when the upstream reports one.
    async fn fetch_stream(&self, video_id: &str)
        -> Result<(ByteStream, Option<u64>), FetchError>;
}

/// Catalog endpoint configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog API, e.g. "https://media.example.com/api/v1/"
    pub base_url: String,

    pub api_key: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5002/api/v1/".to_string(),
            api_key: None,
        }
    }
}

/// HTTP implementation of the catalog client over reqwest streaming
pub struct HttpCatalogClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpCatalogClient {
    pub fn new(catalog: &CatalogConfig, download: &DownloadConfig) -> AppResult<Self> {
        let base_url = Url::parse(&catalog.base_url)
            .map_err(|e| AppError::Config(format!("invalid catalog base URL: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &download.headers {
            headers.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| AppError::Config(format!("invalid header name {:?}: {}", name, e)))?,
                reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| AppError::Config(format!("invalid value for header {:?}: {}", name, e)))?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(download.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(&download.user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: catalog.api_key.clone(),
        })
    }

    fn endpoint(&self, video_id: &str, suffix: &str) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(&format!("videos/{}{}", video_id, suffix))
            .map_err(|e| errors::invalid_video_id(&format!("{} ({})", video_id, e)))?;

        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }
}

#[async_trait]
impl VideoCatalogClient for HttpCatalogClient {
    async fn fetch_metadata(&self, video_id: &str) -> Result<VideoMetadata, FetchError> {
        let url = self.endpoint(video_id, "")?;
        debug!(video_id, %url, "fetching video metadata");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_error_response(response, video_id).await);
        }

        let raw: serde_json::Value = response.json().await.map_err(classify_reqwest_error)?;

        Ok(VideoMetadata {
            video_id: video_id.to_string(),
            title: raw
                .get("title")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            container: raw
                .get("container")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            size_hint: raw.get("size_bytes").and_then(|v| v.as_u64()),
            raw,
        })
    }

    async fn fetch_stream(
        &self,
        video_id: &str,
    ) -> Result<(ByteStream, Option<u64>), FetchError> {
        let url = self.endpoint(video_id, "/stream")?;
        debug!(video_id, %url, "opening media stream");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_error_response(response, video_id).await);
        }

        let total = response.content_length();
        let stream = response.bytes_stream();

        use futures_util::TryStreamExt;
        let stream: ByteStream = Box::pin(stream.map_err(classify_reqwest_error));
        Ok((stream, total))
    }
}

/// Map a non-success response into the fetch error taxonomy. A 403 needs
/// its body inspected: the platform reports quota exhaustion through a 403
/// with a quota reason rather than a dedicated status.
async fn classify_error_response(response: reqwest::Response, video_id: &str) -> FetchError {
    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        return classify_forbidden(&body, video_id);
    }
    classify_status(status, video_id)
}

fn classify_forbidden(body: &str, video_id: &str) -> FetchError {
    if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") {
        errors::quota_exceeded(format!("platform quota exhausted while fetching {}", video_id))
    } else {
        errors::permission_denied(format!("upstream denied access to {}", video_id))
    }
}

/// Map an upstream HTTP status into the fetch error taxonomy
fn classify_status(status: StatusCode, video_id: &str) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => errors::invalid_video_id(video_id),
        StatusCode::GONE => errors::video_removed(video_id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            errors::permission_denied(format!("upstream denied access to {}", video_id))
        }
        StatusCode::TOO_MANY_REQUESTS => errors::rate_limited("upstream rate limit hit"),
        s if s.is_server_error() => errors::upstream_http(s.as_u16(), true),
        s => errors::upstream_http(s.as_u16(), false),
    }
}

/// Map reqwest transport failures: connect/timeout/body errors are network
/// blips worth retrying, everything else is treated as permanent protocol
/// breakage.
fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        errors::transient_network(err.to_string())
    } else {
        FetchError::Permanent {
            kind: FetchErrorKind::Http,
            message: err.to_string(),
        }
    }
}
