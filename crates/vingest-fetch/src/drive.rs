//! Cloud-drive share link fetcher.
//!
//! Resolves a share URL to a file id and downloads it in one of three
//! authentication modes, in priority order:
//!
//! 1. OAuth refresh token: copy the file into the authenticated account
//!    to dodge per-file download quotas, fetch the copy, delete the
//!    copy whatever happens.
//! 2. API key: signed metadata + media fetch.
//! 3. Unauthenticated: follow the public "confirm large file"
//!    interstitial by scraping its confirmation token.

use serde::Deserialize;
use tracing::{debug, info, warn};

use vingest_models::{nonce, sanitize_file_name, ProgressStage};

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{stream_response_to_file, FetchContext, FetchedFile};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const PUBLIC_DOWNLOAD_BASE: &str = "https://drive.google.com/uc?export=download";

/// Drive credentials. Any subset may be configured; the fetcher picks
/// the strongest available mode.
#[derive(Debug, Clone, Default)]
pub struct DriveConfig {
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl DriveConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("DRIVE_API_KEY").ok(),
            client_id: std::env::var("DRIVE_CLIENT_ID").ok(),
            client_secret: std::env::var("DRIVE_CLIENT_SECRET").ok(),
            refresh_token: std::env::var("DRIVE_REFRESH_TOKEN").ok(),
        }
    }

    fn oauth(&self) -> Option<(&str, &str, &str)> {
        match (&self.client_id, &self.client_secret, &self.refresh_token) {
            (Some(id), Some(secret), Some(token)) => Some((id, secret, token)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default, rename = "mimeType")]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CopyResponse {
    id: String,
}

pub struct DriveFetcher {
    config: DriveConfig,
    client: reqwest::Client,
}

impl DriveFetcher {
    pub fn new(config: DriveConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn fetch(
        &self,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let file_id = parse_drive_file_id(&spec.source_ref)?;
        debug!(file_id = %file_id, "Resolved drive file id");

        if let Some((client_id, client_secret, refresh_token)) = self.config.oauth() {
            match self
                .fetch_with_oauth(&file_id, client_id, client_secret, refresh_token, spec, ctx)
                .await
            {
                Ok(file) => return Ok(file),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "OAuth drive download failed, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(api_key) = &self.config.api_key {
            match self.fetch_with_api_key(&file_id, api_key, spec, ctx).await {
                Ok(file) => return Ok(file),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "API-key drive download failed, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        self.fetch_public(&file_id, spec, ctx).await
    }

    async fn oauth_access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> FetchResult<String> {
        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::access_denied(format!(
                "token refresh failed with HTTP {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn fetch_with_oauth(
        &self,
        file_id: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let token = self
            .oauth_access_token(client_id, client_secret, refresh_token)
            .await?;

        let metadata = self.metadata(file_id, Some(&token), None).await?;
        self.validate_metadata(&metadata, ctx)?;

        // Copy into the authenticated account so the download draws on
        // our own quota rather than the share's.
        let copy_id = match self.copy_file(file_id, &token).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Drive copy failed, downloading original directly");
                None
            }
        };
        let download_id = copy_id.as_deref().unwrap_or(file_id);

        let result = self
            .download_media(download_id, Some(&token), None, &metadata, spec, ctx)
            .await;

        // The copy must not outlive the import, success or not.
        if let Some(copy_id) = copy_id {
            if let Err(e) = self.delete_file(&copy_id, &token).await {
                warn!(copy_id = %copy_id, error = %e, "Failed to delete drive copy");
            }
        }

        result
    }

    async fn fetch_with_api_key(
        &self,
        file_id: &str,
        api_key: &str,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let metadata = self.metadata(file_id, None, Some(api_key)).await?;
        self.validate_metadata(&metadata, ctx)?;
        self.download_media(file_id, None, Some(api_key), &metadata, spec, ctx)
            .await
    }

    async fn fetch_public(
        &self,
        file_id: &str,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let url = format!("{}&id={}", PUBLIC_DOWNLOAD_BASE, file_id);
        let response = self.client.get(&url).send().await?;
        let response = map_drive_status(response, file_id)?;

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);

        let response = if is_html {
            // Interstitial page for large files: scrape the confirm
            // token and retry.
            let body = response.text().await?;
            check_quota_page(&body)?;
            let confirm_url = confirm_url_from_interstitial(&body, file_id).ok_or_else(|| {
                FetchError::access_denied(format!(
                    "drive file {} is not publicly downloadable",
                    file_id
                ))
            })?;
            let retried = self.client.get(&confirm_url).send().await?;
            let retried = map_drive_status(retried, file_id)?;
            let still_html = retried
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/html"))
                .unwrap_or(false);
            if still_html {
                return Err(FetchError::access_denied(format!(
                    "drive confirm flow did not yield a file for {}",
                    file_id
                )));
            }
            retried
        } else {
            response
        };

        let total_hint = response.content_length();
        if let Some(declared) = total_hint {
            if declared > ctx.max_file_size {
                return Err(FetchError::SizeExceeded {
                    declared,
                    max: ctx.max_file_size,
                });
            }
        }

        let file_name = spec
            .file_name
            .clone()
            .or_else(|| {
                response
                    .headers()
                    .get(reqwest::header::CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(crate::url::parse_content_disposition)
            })
            .unwrap_or_else(|| format!("{}.mp4", file_id));
        let file_name = sanitize_file_name(&file_name);

        let dest = ctx.temp_dir.join(format!("{}-{}", nonce(), file_name));
        ctx.track_temp_file(&dest).await;
        ctx.report_stage(
            ProgressStage::Downloading,
            0.0,
            format!("Downloading {} from drive", file_name),
        );

        let size = stream_response_to_file(response, &dest, total_hint, ctx).await?;
        info!(file_id = %file_id, size_mb = size as f64 / 1_048_576.0, "Downloaded public drive file");
        Ok(FetchedFile::new(dest, file_name, size))
    }

    async fn metadata(
        &self,
        file_id: &str,
        token: Option<&str>,
        api_key: Option<&str>,
    ) -> FetchResult<FileMetadata> {
        let mut request = self
            .client
            .get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .query(&[("fields", "id,name,size,mimeType"), ("supportsAllDrives", "true")]);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(key) = api_key {
            request = request.query(&[("key", key)]);
        }
        let response = request.send().await?;
        let response = map_drive_status(response, file_id)?;
        Ok(response.json().await?)
    }

    fn validate_metadata(&self, metadata: &FileMetadata, ctx: &FetchContext) -> FetchResult<()> {
        if let Some(size) = metadata.size.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            if size > ctx.max_file_size {
                return Err(FetchError::SizeExceeded {
                    declared: size,
                    max: ctx.max_file_size,
                });
            }
        }
        if let Some(mime) = &metadata.mime_type {
            if !mime.starts_with("video/") {
                return Err(FetchError::NotAVideo(mime.clone()));
            }
        }
        Ok(())
    }

    async fn copy_file(&self, file_id: &str, token: &str) -> FetchResult<String> {
        let response = self
            .client
            .post(format!("{}/files/{}/copy", DRIVE_API_BASE, file_id))
            .bearer_auth(token)
            .query(&[("supportsAllDrives", "true")])
            .json(&serde_json::json!({ "name": format!("vingest-copy-{}", nonce()) }))
            .send()
            .await?;
        let response = map_drive_status(response, file_id)?;
        let copy: CopyResponse = response.json().await?;
        debug!(file_id = %file_id, copy_id = %copy.id, "Copied drive file");
        Ok(copy.id)
    }

    async fn delete_file(&self, file_id: &str, token: &str) -> FetchResult<()> {
        let response = self
            .client
            .delete(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(FetchError::unavailable(format!(
                "drive delete returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn download_media(
        &self,
        file_id: &str,
        token: Option<&str>,
        api_key: Option<&str>,
        metadata: &FileMetadata,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let mut request = self
            .client
            .get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .timeout(ctx.download_timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(key) = api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await?;
        let response = map_drive_status(response, file_id)?;

        let total_hint = response
            .content_length()
            .or_else(|| metadata.size.as_deref().and_then(|s| s.parse().ok()));

        let file_name = spec
            .file_name
            .clone()
            .or_else(|| metadata.name.clone())
            .unwrap_or_else(|| format!("{}.mp4", file_id));
        let file_name = sanitize_file_name(&file_name);

        let dest = ctx.temp_dir.join(format!("{}-{}", nonce(), file_name));
        ctx.track_temp_file(&dest).await;
        ctx.report_stage(
            ProgressStage::Downloading,
            0.0,
            format!("Downloading {} from drive", file_name),
        );

        let size = stream_response_to_file(response, &dest, total_hint, ctx).await?;
        info!(file_id = %file_id, size_mb = size as f64 / 1_048_576.0, "Downloaded drive file");
        Ok(FetchedFile::new(dest, file_name, size))
    }
}

/// Normalize drive HTTP failures into the taxonomy.
fn map_drive_status(response: reqwest::Response, file_id: &str) -> FetchResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status.as_u16() {
        401 | 403 => FetchError::access_denied(format!("drive returned HTTP {} for {}", status, file_id)),
        404 => FetchError::not_found(format!("drive file {} not found", file_id)),
        429 => FetchError::QuotaExceeded(format!("drive rate limit for {}", file_id)),
        _ => FetchError::unavailable(format!("drive returned HTTP {} for {}", status, file_id)),
    })
}

/// Detect the quota-exceeded interstitial.
fn check_quota_page(body: &str) -> FetchResult<()> {
    let lower = body.to_ascii_lowercase();
    if lower.contains("quota") && lower.contains("exceeded") {
        return Err(FetchError::QuotaExceeded(
            "download quota for this file has been exceeded".to_string(),
        ));
    }
    Ok(())
}

/// Extract the file id from the supported share URL shapes.
pub fn parse_drive_file_id(url: &str) -> FetchResult<String> {
    let url = url.trim();

    // /file/d/<id>[/view]
    if let Some(pos) = url.find("/file/d/") {
        let rest = &url[pos + "/file/d/".len()..];
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    // open?id=<id>, uc?id=<id>, uc?export=download&id=<id>
    for marker in ["?id=", "&id="] {
        if let Some(pos) = url.find(marker) {
            let rest = &url[pos + marker.len()..];
            let id: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if !id.is_empty() {
                return Ok(id);
            }
        }
    }

    // A bare id is accepted too.
    if !url.is_empty()
        && !url.contains('/')
        && url.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Ok(url.to_string());
    }

    Err(FetchError::invalid_source(format!(
        "could not extract a drive file id from {}",
        url
    )))
}

/// Scrape the confirm URL out of the large-file interstitial page.
///
/// Prefers the `confirm=<tok>` token; falls back to an alternate
/// download href when present.
pub fn confirm_url_from_interstitial(body: &str, file_id: &str) -> Option<String> {
    if let Some(pos) = body.find("confirm=") {
        let rest = &body[pos + "confirm=".len()..];
        let token: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if !token.is_empty() {
            return Some(format!(
                "{}&id={}&confirm={}",
                PUBLIC_DOWNLOAD_BASE, file_id, token
            ));
        }
    }

    // Alternate: an href pointing straight at the download endpoint.
    if let Some(pos) = body.find("href=\"/uc?") {
        let rest = &body[pos + "href=\"".len()..];
        let href: String = rest.chars().take_while(|c| *c != '"').collect();
        if !href.is_empty() {
            let href = href.replace("&amp;", "&");
            return Some(format!("https://drive.google.com{}", href));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_share_url_shapes() {
        assert_eq!(
            parse_drive_file_id("https://drive.google.com/file/d/1AbC-xyz_123/view?usp=sharing")
                .unwrap(),
            "1AbC-xyz_123"
        );
        assert_eq!(
            parse_drive_file_id("https://drive.google.com/open?id=1AbC-xyz_123").unwrap(),
            "1AbC-xyz_123"
        );
        assert_eq!(
            parse_drive_file_id("https://drive.google.com/uc?id=1AbC-xyz_123").unwrap(),
            "1AbC-xyz_123"
        );
        assert_eq!(
            parse_drive_file_id("https://drive.google.com/uc?export=download&id=1AbC-xyz_123")
                .unwrap(),
            "1AbC-xyz_123"
        );
        assert_eq!(parse_drive_file_id("1AbC-xyz_123").unwrap(), "1AbC-xyz_123");
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(parse_drive_file_id("https://example.com/video.mp4").is_err());
        assert!(parse_drive_file_id("").is_err());
    }

    #[test]
    fn scrapes_confirm_token() {
        let body = r#"<form action="/uc?export=download"><input name="confirm" value="t"></form>
            <a href="/uc?export=download&amp;confirm=AbcD&amp;id=FILE">download anyway</a>"#;
        let url = confirm_url_from_interstitial(body, "FILE").unwrap();
        assert!(url.contains("confirm=AbcD"));
        assert!(url.contains("id=FILE"));
    }

    #[test]
    fn scrapes_alternate_href() {
        let body = r#"<a id="uc-download-link" href="/uc?export=download&amp;id=FILE&amp;token=xy">Download</a>"#;
        let url = confirm_url_from_interstitial(body, "FILE").unwrap();
        assert_eq!(
            url,
            "https://drive.google.com/uc?export=download&id=FILE&token=xy"
        );
    }

    #[test]
    fn quota_page_detected() {
        let body = "Sorry, you can't view or download this file at this time. \
                    The download quota has been exceeded.";
        assert!(matches!(
            check_quota_page(body),
            Err(FetchError::QuotaExceeded(_))
        ));
        assert!(check_quota_page("<html>regular page</html>").is_ok());
    }
}
