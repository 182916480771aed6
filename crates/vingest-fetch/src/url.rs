//! Direct URL fetcher.
//!
//! Streams a `GET` to disk with a browser-like user agent, honoring
//! `Content-Length` for the size cap and `Content-Disposition` for the
//! file name.

use std::time::Duration;

use reqwest::header;
use tracing::{info, warn};

use vingest_models::{nonce, sanitize_file_name, ProgressStage};

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{stream_response_to_file, FetchContext, FetchedFile};
use crate::retry::{retry_async, RetryConfig};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const MAX_REDIRECTS: usize = 5;

pub struct UrlFetcher;

impl UrlFetcher {
    pub fn new() -> Self {
        Self
    }

    pub async fn fetch(
        &self,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let url = spec.source_ref.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::invalid_source(format!(
                "not an http(s) url: {}",
                url
            )));
        }

        let retry = RetryConfig::new("direct_url_download")
            .with_max_retries(2)
            .with_base_delay(Duration::from_secs(2));

        // Only transport-level hiccups are worth an in-place retry;
        // HTTP failures surface so the queue's attempt accounting sees
        // them.
        retry_async(
            &retry,
            |e| matches!(e, FetchError::Http(_)),
            || self.fetch_once(url, spec.file_name.as_deref(), ctx),
        )
        .await
        .into_result()
    }

    async fn fetch_once(
        &self,
        url: &str,
        preferred_name: Option<&str>,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        ctx.check_cancelled()?;

        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(ctx.download_timeout)
            .build()?;

        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => FetchError::access_denied(format!("HTTP {} from {}", status, url)),
                404 => FetchError::not_found(url.to_string()),
                _ => FetchError::unavailable(format!("HTTP {} from {}", status, url)),
            });
        }

        let content_length = response.content_length();
        if let Some(declared) = content_length {
            if declared > ctx.max_file_size {
                return Err(FetchError::SizeExceeded {
                    declared,
                    max: ctx.max_file_size,
                });
            }
        }

        let file_name = preferred_name
            .map(|n| n.to_string())
            .or_else(|| filename_from_content_disposition(&response))
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| "download.mp4".to_string());
        let file_name = sanitize_file_name(&file_name);

        let dest = ctx.temp_dir.join(format!("{}-{}", nonce(), file_name));
        ctx.track_temp_file(&dest).await;

        ctx.report_stage(
            ProgressStage::Downloading,
            0.0,
            format!("Downloading {}", file_name),
        );

        let size = stream_response_to_file(response, &dest, content_length, ctx).await?;
        if let Some(declared) = content_length {
            if size < declared {
                warn!(url = url, declared, received = size, "Short read from source");
                return Err(FetchError::unavailable(format!(
                    "connection closed after {} of {} bytes",
                    size, declared
                )));
            }
        }

        info!(
            url = url,
            path = %dest.display(),
            size_mb = size as f64 / 1_048_576.0,
            "Downloaded source from URL"
        );

        Ok(FetchedFile::new(dest, file_name, size))
    }
}

/// Pull a file name out of a `Content-Disposition` header.
fn filename_from_content_disposition(response: &reqwest::Response) -> Option<String> {
    let value = response
        .headers()
        .get(header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    parse_content_disposition(value)
}

pub(crate) fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = rest.rsplit('\'').next()?;
            let decoded = urlencoding::decode(encoded).ok()?;
            return Some(decoded.into_owned());
        }
        if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Fall back to the URL path basename.
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let basename = without_query.rsplit('/').next()?;
    if basename.is_empty() || basename.contains("://") {
        None
    } else {
        Some(basename.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_plain() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"clip.mp4\""),
            Some("clip.mp4".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=clip.mp4"),
            Some("clip.mp4".to_string())
        );
    }

    #[test]
    fn content_disposition_rfc5987() {
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''my%20clip.mp4"),
            Some("my clip.mp4".to_string())
        );
    }

    #[test]
    fn content_disposition_missing() {
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn url_basename() {
        assert_eq!(
            filename_from_url("https://example.com/videos/clip.mp4?sig=abc"),
            Some("clip.mp4".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
    }
}
