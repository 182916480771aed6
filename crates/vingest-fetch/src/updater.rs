//! Downloader-binary settings hook.
//!
//! The admin control plane owns the downloader version; before a
//! platform download the worker may ask this hook to refresh the
//! binary. Every failure here is logged and swallowed, the download
//! proceeds with whatever binary is installed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FetchError, FetchResult};

/// Control-plane settings for the downloader binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloaderSettings {
    /// Release channel, e.g. "stable" or "nightly"
    pub channel: String,
    pub auto_update: bool,
    /// Minimum seconds between update checks
    pub update_frequency: u64,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
}

/// Client for the control-plane settings API plus the self-update run.
pub struct DownloaderUpdater {
    admin_url: Option<String>,
    admin_secret: Option<String>,
    downloader_bin: String,
    client: reqwest::Client,
}

impl DownloaderUpdater {
    pub fn new(
        admin_url: Option<String>,
        admin_secret: Option<String>,
        downloader_bin: impl Into<String>,
    ) -> Self {
        Self {
            admin_url,
            admin_secret,
            downloader_bin: downloader_bin.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Refresh the downloader binary when the control plane says an
    /// update is due. Never fails the caller.
    pub async fn maybe_update(&self) {
        match self.try_update().await {
            Ok(true) => info!("Downloader binary updated"),
            Ok(false) => debug!("Downloader update not due"),
            Err(e) => warn!(error = %e, "Downloader update failed, continuing with current binary"),
        }
    }

    async fn try_update(&self) -> FetchResult<bool> {
        let mut settings = self.fetch_settings().await?;
        if !settings.auto_update {
            return Ok(false);
        }
        let due = match settings.last_checked {
            Some(at) => (Utc::now() - at).num_seconds() >= settings.update_frequency as i64,
            None => true,
        };
        if !due {
            return Ok(false);
        }

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(120),
            tokio::process::Command::new(&self.downloader_bin)
                .arg("-U")
                .output(),
        )
        .await
        .map_err(|_| FetchError::unavailable("downloader self-update timed out"))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::unavailable(format!(
                "downloader self-update exited non-zero: {}",
                stderr.lines().last().unwrap_or("unknown error")
            )));
        }

        settings.current_version = self.current_version().await;
        settings.last_checked = Some(Utc::now());
        self.put_settings(&settings).await?;
        Ok(true)
    }

    /// `GET <admin>/api/settings`
    pub async fn fetch_settings(&self) -> FetchResult<DownloaderSettings> {
        let base = self
            .admin_url
            .as_deref()
            .ok_or_else(|| FetchError::unavailable("no admin API configured"))?;
        let mut request = self
            .client
            .get(format!("{}/api/settings", base.trim_end_matches('/')))
            .timeout(std::time::Duration::from_secs(10));
        if let Some(secret) = &self.admin_secret {
            request = request.header("x-internal-secret", secret);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::unavailable(format!(
                "settings API returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// `PUT <admin>/api/settings`
    pub async fn put_settings(&self, settings: &DownloaderSettings) -> FetchResult<()> {
        let base = self
            .admin_url
            .as_deref()
            .ok_or_else(|| FetchError::unavailable("no admin API configured"))?;
        let mut request = self
            .client
            .put(format!("{}/api/settings", base.trim_end_matches('/')))
            .timeout(std::time::Duration::from_secs(10))
            .json(settings);
        if let Some(secret) = &self.admin_secret {
            request = request.header("x-internal-secret", secret);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::unavailable(format!(
                "settings API returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn current_version(&self) -> Option<String> {
        let output = tokio::process::Command::new(&self.downloader_bin)
            .arg("--version")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_wire_shape() {
        let json = r#"{"channel":"stable","autoUpdate":true,"updateFrequency":86400,
            "currentVersion":"2025.01.15","lastChecked":"2026-08-01T00:00:00Z"}"#;
        let settings: DownloaderSettings = serde_json::from_str(json).expect("parse");
        assert_eq!(settings.channel, "stable");
        assert!(settings.auto_update);
        assert_eq!(settings.update_frequency, 86400);
        assert_eq!(settings.current_version.as_deref(), Some("2025.01.15"));
    }

    #[tokio::test]
    async fn update_without_admin_api_is_swallowed() {
        let updater = DownloaderUpdater::new(None, None, "definitely-not-a-binary");
        // Must not panic or error out.
        updater.maybe_update().await;
    }
}
