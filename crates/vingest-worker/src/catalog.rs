//! Catalog webhook emitter.
//!
//! The external catalog learns only of terminal outcomes. Every call
//! here is fire-and-forget: failures are logged and swallowed, a
//! webhook can never change a job's fate.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use vingest_models::{ImportJob, ImportResult};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Which success webhook applies to a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessCall {
    /// No catalog record yet: `POST /user/videos`
    CreateVideo,
    /// Existing record, first-attempt success:
    /// `PUT /user/videos/{id}/source-link`
    UpdateSourceLink,
    /// Existing record, success after retries:
    /// `POST /user/videos/{id}/import-success`
    ReportRetrySuccess,
}

impl SuccessCall {
    /// Exactly one call per successful job, selected by catalog id and
    /// attempt count.
    pub fn choose(catalog_id: Option<&str>, attempts_made: u32) -> Self {
        match (catalog_id, attempts_made) {
            (None, _) => SuccessCall::CreateVideo,
            (Some(_), 0) => SuccessCall::UpdateSourceLink,
            (Some(_), _) => SuccessCall::ReportRetrySuccess,
        }
    }
}

/// Catalog API configuration.
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    /// Catalog API base URL; unset disables all webhooks
    pub api_url: Option<String>,
    /// Default API key when the job carries none
    pub api_key: Option<String>,
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("CATALOG_API_URL").ok(),
            api_key: std::env::var("CATALOG_API_KEY").ok(),
        }
    }
}

/// Client for the catalog webhook API.
pub struct CatalogClient {
    config: CatalogConfig,
    client: reqwest::Client,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> Option<&str> {
        self.config.api_url.as_deref().map(|u| u.trim_end_matches('/'))
    }

    fn api_key<'a>(&'a self, job: &'a ImportJob) -> Option<&'a str> {
        job.spec.api_key.as_deref().or(self.config.api_key.as_deref())
    }

    /// Notify the catalog of a successful import. Exactly one call is
    /// made, chosen by `SuccessCall::choose`.
    pub async fn notify_success(&self, job: &ImportJob, result: &ImportResult) {
        let Some(base) = self.base_url() else {
            debug!("Catalog API not configured, skipping success webhook");
            return;
        };
        if self.api_key(job).is_none() {
            debug!(job_id = %job.id(), "No catalog API key, skipping success webhook");
            return;
        }

        let call = SuccessCall::choose(job.spec.catalog_id.as_deref(), result.attempts_made);
        let request = match call {
            SuccessCall::CreateVideo => self
                .client
                .post(format!("{}/user/videos", base))
                .json(&json!({
                    "name": result.file_name,
                    "sourceLink": result.cdn_url,
                    "importJobId": job.id().as_str(),
                })),
            SuccessCall::UpdateSourceLink => {
                let catalog_id = job.spec.catalog_id.as_deref().unwrap_or_default();
                self.client
                    .put(format!("{}/user/videos/{}/source-link", base, catalog_id))
                    .json(&json!({
                        "sourceLink": result.cdn_url,
                        "importJobId": job.id().as_str(),
                    }))
            }
            SuccessCall::ReportRetrySuccess => {
                let catalog_id = job.spec.catalog_id.as_deref().unwrap_or_default();
                self.client
                    .post(format!("{}/user/videos/{}/import-success", base, catalog_id))
                    .json(&json!({
                        "sourceLink": result.cdn_url,
                        "isRetry": true,
                        "importJobId": job.id().as_str(),
                    }))
            }
        };

        self.send(job, request, "success").await;
    }

    /// Notify the catalog of a terminal failure. Only fires when the
    /// job carries a catalog id.
    pub async fn notify_failure(&self, job: &ImportJob, error: &str) {
        let Some(base) = self.base_url() else {
            return;
        };
        let Some(catalog_id) = job.spec.catalog_id.as_deref() else {
            debug!(job_id = %job.id(), "No catalog id, skipping failure webhook");
            return;
        };
        let Some(key) = self.api_key(job) else {
            debug!(job_id = %job.id(), "No catalog API key, skipping failure webhook");
            return;
        };

        let request = self
            .client
            .post(format!("{}/user/videos/{}/import-failed", base, catalog_id))
            .bearer_auth(key)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&json!({
                "error": error,
                "sourceUrl": job.spec.source_ref,
                "retryCount": job.attempts_made,
            }));

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(job_id = %job.id(), "Catalog failure webhook delivered");
            }
            Ok(response) => {
                warn!(job_id = %job.id(), status = %response.status(), "Catalog failure webhook rejected");
            }
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "Catalog failure webhook failed");
            }
        }
    }

    async fn send(&self, job: &ImportJob, request: reqwest::RequestBuilder, what: &str) {
        let key = match self.api_key(job) {
            Some(key) => key.to_string(),
            None => return,
        };
        let result = request
            .bearer_auth(key)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(job_id = %job.id(), "Catalog {} webhook delivered", what);
            }
            Ok(response) => {
                warn!(job_id = %job.id(), status = %response.status(), "Catalog {} webhook rejected", what);
            }
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "Catalog {} webhook failed", what);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_call_selection() {
        assert_eq!(SuccessCall::choose(None, 0), SuccessCall::CreateVideo);
        assert_eq!(SuccessCall::choose(None, 2), SuccessCall::CreateVideo);
        assert_eq!(
            SuccessCall::choose(Some("cat-1"), 0),
            SuccessCall::UpdateSourceLink
        );
        assert_eq!(
            SuccessCall::choose(Some("cat-1"), 1),
            SuccessCall::ReportRetrySuccess
        );
    }
}
