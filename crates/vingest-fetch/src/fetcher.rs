//! The uniform fetch contract and its dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vingest_models::{EgressAttempt, ImportSpec, Progress, ProgressStage, SelectedQuality, SourceKind};

use crate::drive::{DriveConfig, DriveFetcher};
use crate::egress::EgressPool;
use crate::error::{FetchError, FetchResult};
use crate::local::LocalFetcher;
use crate::platform::{PlatformConfig, PlatformFetcher};
use crate::url::UrlFetcher;

/// Progress granularity for byte-counted downloads (0.1%).
const DOWNLOAD_PROGRESS_STEP: f64 = 0.1;

/// Fallback reporting interval when the total size is unknown.
const UNKNOWN_SIZE_REPORT_BYTES: u64 = 8 * 1024 * 1024;

/// Output of a fetcher.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Where the file landed in the temp directory
    pub local_path: PathBuf,
    /// Resolved file name (source-provided or derived)
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// Egress attempts, one per identity tried (platform fetcher only)
    pub egress_attempts: Vec<EgressAttempt>,
    /// Quality the downloader selected (platform fetcher only)
    pub selected_quality: Option<SelectedQuality>,
}

impl FetchedFile {
    pub fn new(local_path: PathBuf, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            local_path,
            file_name: file_name.into(),
            size,
            egress_attempts: Vec::new(),
            selected_quality: None,
        }
    }
}

type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;
type TempFileSink =
    Arc<dyn Fn(PathBuf) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Everything a fetcher needs besides the job spec.
#[derive(Clone)]
pub struct FetchContext {
    /// Process-wide temp directory
    pub temp_dir: PathBuf,
    /// Global cap on file size in bytes
    pub max_file_size: u64,
    /// Per-request download timeout
    pub download_timeout: Duration,
    /// Raised by `kill_active` and shutdown
    pub cancel: CancellationToken,
    progress: ProgressSink,
    temp_file: TempFileSink,
}

impl FetchContext {
    pub fn new(
        temp_dir: PathBuf,
        max_file_size: u64,
        download_timeout: Duration,
        cancel: CancellationToken,
        progress: ProgressSink,
        temp_file: TempFileSink,
    ) -> Self {
        Self {
            temp_dir,
            max_file_size,
            download_timeout,
            cancel,
            progress,
            temp_file,
        }
    }

    /// Emit a progress snapshot.
    pub fn report(&self, progress: Progress) {
        (self.progress)(progress);
    }

    /// Emit a plain stage/percentage update.
    pub fn report_stage(&self, stage: ProgressStage, percentage: f64, message: impl Into<String>) {
        self.report(Progress::stage(stage, percentage, message));
    }

    /// Register a temp file with the recovery mirror. Completes before
    /// returning, so callers can rely on registration preceding the
    /// first byte written to the path. A trailing `*` marks a prefix
    /// that covers fragment files too.
    pub async fn track_temp_file(&self, path: &Path) {
        (self.temp_file)(path.to_path_buf()).await;
    }

    /// Bail out if the job was cancelled.
    pub fn check_cancelled(&self) -> FetchResult<()> {
        if self.cancel.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The four source fetchers behind a single dispatch.
pub struct SourceFetcher {
    url: UrlFetcher,
    drive: DriveFetcher,
    platform: PlatformFetcher,
    local: LocalFetcher,
}

impl SourceFetcher {
    pub fn new(drive_config: DriveConfig, platform_config: PlatformConfig, egress: Arc<EgressPool>) -> Self {
        Self {
            url: UrlFetcher::new(),
            drive: DriveFetcher::new(drive_config),
            platform: PlatformFetcher::new(platform_config, egress),
            local: LocalFetcher::new(),
        }
    }

    /// Fetch the job's source to a local temp file.
    pub async fn fetch(&self, spec: &ImportSpec, ctx: &FetchContext) -> FetchResult<FetchedFile> {
        debug!(source_kind = %spec.source_kind, "Dispatching fetch");
        match spec.source_kind {
            SourceKind::Url => self.url.fetch(spec, ctx).await,
            SourceKind::Drive => self.drive.fetch(spec, ctx).await,
            SourceKind::Platform => self.platform.fetch(spec, ctx).await,
            SourceKind::Local => self.local.fetch(spec, ctx).await,
        }
    }
}

/// Stream an HTTP response body to a file with bounded memory, cap
/// enforcement and throttled progress.
///
/// The destination must already be registered as a temp file; on any
/// error the partial file is removed before the error propagates.
pub(crate) async fn stream_response_to_file(
    response: reqwest::Response,
    dest: &Path,
    total_hint: Option<u64>,
    ctx: &FetchContext,
) -> FetchResult<u64> {
    let result = stream_body(response, dest, total_hint, ctx).await;
    if result.is_err() {
        tokio::fs::remove_file(dest).await.ok();
    }
    result
}

async fn stream_body(
    response: reqwest::Response,
    dest: &Path,
    total_hint: Option<u64>,
    ctx: &FetchContext,
) -> FetchResult<u64> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();

    let mut written: u64 = 0;
    let mut last_percent = 0.0f64;
    let mut last_reported_bytes = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        written += chunk.len() as u64;
        if written > ctx.max_file_size {
            return Err(FetchError::SizeExceeded {
                declared: written,
                max: ctx.max_file_size,
            });
        }
        file.write_all(&chunk).await?;

        match total_hint {
            Some(total) if total > 0 => {
                let percent = (written as f64 / total as f64) * 100.0;
                if percent - last_percent >= DOWNLOAD_PROGRESS_STEP {
                    last_percent = percent;
                    ctx.report_stage(
                        ProgressStage::Downloading,
                        percent.min(100.0),
                        format!("Downloaded {} of {} bytes", written, total),
                    );
                }
            }
            _ => {
                if written - last_reported_bytes >= UNKNOWN_SIZE_REPORT_BYTES {
                    last_reported_bytes = written;
                    ctx.report_stage(
                        ProgressStage::Downloading,
                        0.0,
                        format!("Downloaded {} bytes", written),
                    );
                }
            }
        }
    }

    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A context wired to a throwaway directory and no-op sinks.
    pub fn context(temp_dir: &Path) -> FetchContext {
        FetchContext::new(
            temp_dir.to_path_buf(),
            10 * 1024 * 1024 * 1024,
            Duration::from_secs(7200),
            CancellationToken::new(),
            Arc::new(|_| {}),
            Arc::new(|_: PathBuf| -> futures_util::future::BoxFuture<'static, ()> {
                Box::pin(async {})
            }),
        )
    }
}
