//! Origin client implementation.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{OriginError, OriginResult};

/// Read buffer for streaming uploads. Kept small so memory stays
/// bounded regardless of file size.
const MAX_STREAM_BUFFER: usize = 8 * 1024;

/// Progress callbacks fire at most once per this many bytes.
const PROGRESS_GRANULARITY: u64 = 1024 * 1024;

const MAX_REDIRECTS: usize = 3;

const CDN_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback receiving `(bytes_sent, total_bytes)`. Must not block; it
/// runs on the transfer path.
pub type UploadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Outcome of an existence probe. The origin answers both 200 and 404
/// as valid responses; anything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectPresence {
    Present,
    Absent,
    Unknown,
}

/// Configuration for the origin client.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Storage API base, e.g. `https://storage.example.com`
    pub base_url: String,
    /// Storage zone name
    pub zone: String,
    /// `AccessKey` header value
    pub access_key: String,
    /// Public CDN base the finished object is served from
    pub cdn_base: String,
    /// Upload timeout; by convention twice the download timeout
    pub upload_timeout: Duration,
    /// Attempts for non-2xx responses
    pub max_retry_attempts: u32,
    /// Read buffer size, capped at 8 KiB
    pub stream_buffer: usize,
}

impl OriginConfig {
    /// Create config from environment variables.
    pub fn from_env() -> OriginResult<Self> {
        let download_timeout_ms: u64 = std::env::var("DOWNLOAD_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2 * 3600 * 1000);
        Ok(Self {
            base_url: std::env::var("STORAGE_BASE_URL")
                .unwrap_or_else(|_| "https://storage.bunnycdn.com".to_string()),
            zone: std::env::var("STORAGE_ZONE")
                .map_err(|_| OriginError::config_error("STORAGE_ZONE not set"))?,
            access_key: std::env::var("STORAGE_ACCESS_KEY")
                .map_err(|_| OriginError::config_error("STORAGE_ACCESS_KEY not set"))?,
            cdn_base: std::env::var("CDN_BASE_URL")
                .map_err(|_| OriginError::config_error("CDN_BASE_URL not set"))?,
            upload_timeout: Duration::from_millis(download_timeout_ms * 2),
            max_retry_attempts: std::env::var("MAX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            stream_buffer: std::env::var("STREAM_BUFFER_KB")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .map(|kb| kb * 1024)
                .unwrap_or(MAX_STREAM_BUFFER)
                .min(MAX_STREAM_BUFFER),
        })
    }
}

/// Client for the object origin.
#[derive(Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    config: OriginConfig,
    cdn_base: String,
}

impl OriginClient {
    /// Create a new origin client from configuration.
    pub fn new(config: OriginConfig) -> OriginResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        let cdn_base = normalize_cdn_base(&config.cdn_base);
        Ok(Self {
            client,
            config,
            cdn_base,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> OriginResult<Self> {
        Self::new(OriginConfig::from_env()?)
    }

    fn object_url(&self, object_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.zone,
            object_name
        )
    }

    /// Public URL of a stored object.
    pub fn cdn_url(&self, object_name: &str) -> String {
        format!("{}/{}", self.cdn_base, object_name)
    }

    /// Stream a file to the origin.
    ///
    /// The file is read through a bounded buffer and piped straight
    /// into the request body; `progress` fires at most once per MiB
    /// plus a final 100% call. Non-2xx responses are retried up to the
    /// configured attempt count, re-opening the file each time.
    pub async fn put_file(
        &self,
        path: impl AsRef<Path>,
        object_name: &str,
        progress: UploadProgress,
    ) -> OriginResult<u64> {
        let path = path.as_ref();
        let size = tokio::fs::metadata(path).await?.len();
        debug!(path = %path.display(), object = object_name, size, "Uploading to origin");

        let mut last_error: Option<OriginError> = None;
        for attempt in 0..self.config.max_retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2u64.saturating_pow(attempt))).await;
                debug!(object = object_name, attempt, "Retrying origin upload");
            }
            match self
                .put_file_once(path, object_name, size, Arc::clone(&progress))
                .await
            {
                Ok(()) => {
                    progress(size, size);
                    info!(
                        object = object_name,
                        size_mb = size as f64 / 1_048_576.0,
                        "Uploaded object to origin"
                    );
                    return Ok(size);
                }
                Err(e) if e.is_retryable() => {
                    warn!(object = object_name, error = %e, "Origin upload attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| OriginError::Network("upload failed".to_string())))
    }

    async fn put_file_once(
        &self,
        path: &Path,
        object_name: &str,
        size: u64,
        progress: UploadProgress,
    ) -> OriginResult<()> {
        let file = tokio::fs::File::open(path).await?;
        let reader = ReaderStream::with_capacity(file, self.config.stream_buffer);

        let sent = Arc::new(AtomicU64::new(0));
        let last_reported = Arc::new(AtomicU64::new(0));
        let counted = {
            let sent = Arc::clone(&sent);
            let last_reported = Arc::clone(&last_reported);
            let progress = Arc::clone(&progress);
            reader.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    let total = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                        + chunk.len() as u64;
                    let last = last_reported.load(Ordering::Relaxed);
                    if total - last >= PROGRESS_GRANULARITY {
                        last_reported.store(total, Ordering::Relaxed);
                        progress(total, size);
                    }
                }
            })
        };

        let response = self
            .client
            .put(self.object_url(object_name))
            .header("AccessKey", &self.config.access_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .timeout(self.config.upload_timeout)
            .body(reqwest::Body::wrap_stream(counted))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 201 {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(OriginError::api(status.as_u16(), truncate(&body, 512)))
        }
    }

    /// Delete an object from the origin.
    pub async fn delete(&self, object_name: &str) -> OriginResult<()> {
        let response = self
            .client
            .delete(self.object_url(object_name))
            .header("AccessKey", &self.config.access_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            debug!(object = object_name, "Deleted object");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(OriginError::api(status.as_u16(), truncate(&body, 512)))
        }
    }

    /// Probe whether an object exists. 200 and 404 are both valid
    /// probe outcomes; transport failures yield `Unknown`.
    pub async fn exists(&self, object_name: &str) -> ObjectPresence {
        let result = self
            .client
            .head(self.object_url(object_name))
            .header("AccessKey", &self.config.access_key)
            .send()
            .await;
        match result {
            Ok(response) => match response.status().as_u16() {
                200 => ObjectPresence::Present,
                404 => ObjectPresence::Absent,
                status => {
                    warn!(object = object_name, status, "Unexpected existence probe status");
                    ObjectPresence::Unknown
                }
            },
            Err(e) => {
                warn!(object = object_name, error = %e, "Existence probe failed");
                ObjectPresence::Unknown
            }
        }
    }

    /// Best-effort check that the object is reachable through the CDN.
    /// A negative result is logged, never fatal.
    pub async fn verify_cdn_access(&self, object_name: &str) -> bool {
        let url = self.cdn_url(object_name);
        let result = self
            .client
            .head(&url)
            .timeout(CDN_VERIFY_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "CDN verification returned non-success");
                false
            }
            Err(e) => {
                warn!(url = %url, error = %e, "CDN verification failed");
                false
            }
        }
    }
}

/// Strip trailing slashes and make sure the base carries a scheme.
pub fn normalize_cdn_base(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_cdn_base() {
        assert_eq!(
            normalize_cdn_base("https://cdn.example.com/"),
            "https://cdn.example.com"
        );
        assert_eq!(
            normalize_cdn_base("cdn.example.com"),
            "https://cdn.example.com"
        );
        assert_eq!(
            normalize_cdn_base("http://cdn.example.com//"),
            "http://cdn.example.com"
        );
    }

    #[test]
    fn cdn_url_assembly() {
        let client = OriginClient::new(OriginConfig {
            base_url: "https://storage.example.com".into(),
            zone: "videos".into(),
            access_key: "key".into(),
            cdn_base: "cdn.example.com/".into(),
            upload_timeout: Duration::from_secs(10),
            max_retry_attempts: 1,
            stream_buffer: 8192,
        })
        .expect("client");

        assert_eq!(
            client.cdn_url("clip-1a2b3c4d.mp4"),
            "https://cdn.example.com/clip-1a2b3c4d.mp4"
        );
        assert_eq!(
            client.object_url("clip-1a2b3c4d.mp4"),
            "https://storage.example.com/videos/clip-1a2b3c4d.mp4"
        );
    }

    #[test]
    fn error_kinds() {
        assert!(OriginError::api(500, "oops").is_retryable());
        assert!(OriginError::Network("reset".into()).is_retryable());
        assert!(!OriginError::config_error("missing key").is_retryable());
    }
}
