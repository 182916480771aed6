//! Platform-id fetcher backed by the external downloader binary.
//!
//! Probes the selected format first, then iterates the egress identity
//! list: each identity gets one child-process run with a hard timeout,
//! line-buffered progress parsing and fragment cleanup on failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use vingest_models::{
    nonce, EgressAttempt, FailureKind, Progress, ProgressStage, SelectedQuality,
};

use crate::egress::EgressPool;
use crate::error::{FetchError, FetchResult};
use crate::fetcher::{FetchContext, FetchedFile};
use crate::probe::{harvest_quality, parse_probe_line, parse_progress_percent};

/// Files below this size are failed downloads, not videos.
const MIN_VIDEO_BYTES: u64 = 5 * 1024 * 1024;

/// Suffixes of partial/fragment files the downloader leaves behind.
const FRAGMENT_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Grace between SIGTERM and SIGKILL when tearing a child down.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Progress rescaling: probing accounts for the first 10%, identity
/// rotation a further 15%, the download itself the rest, and the final
/// slice is reserved for post-download validation.
const PROBE_SHARE: f64 = 10.0;
const ROTATION_SHARE: f64 = 15.0;
const DOWNLOAD_SHARE: f64 = 0.75;
const DOWNLOAD_CLAMP: f64 = 89.0;

/// Platform fetcher configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Downloader binary name or path
    pub downloader_bin: String,
    /// Height cap for format selection
    pub max_height: u32,
    /// Hard timeout for one download child
    pub child_timeout: Duration,
    /// Timeout for the pre-probe invocation
    pub probe_timeout: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            downloader_bin: "yt-dlp".to_string(),
            max_height: 1080,
            child_timeout: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            downloader_bin: std::env::var("DOWNLOADER_BIN")
                .unwrap_or(defaults.downloader_bin),
            max_height: std::env::var("DOWNLOADER_MAX_HEIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_height),
            ..defaults
        }
    }

    /// Format selector: capped height, prefer higher bitrate, exclude
    /// HDR and experimental codecs.
    fn format_selector(&self) -> String {
        format!(
            "bestvideo[height<={h}][vcodec!*=av01][dynamic_range!*=HDR]+bestaudio/best[height<={h}]",
            h = self.max_height
        )
    }
}

pub struct PlatformFetcher {
    config: PlatformConfig,
    egress: Arc<EgressPool>,
}

enum DownloadOutcome {
    Success { path: PathBuf, size: u64 },
    Failed { message: String, kind: Option<FailureKind> },
    TimedOut,
}

impl PlatformFetcher {
    pub fn new(config: PlatformConfig, egress: Arc<EgressPool>) -> Self {
        Self { config, egress }
    }

    pub async fn fetch(
        &self,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        let source = spec.source_ref.trim();
        if source.is_empty() {
            return Err(FetchError::invalid_source("empty platform reference"));
        }

        which::which(&self.config.downloader_bin)
            .map_err(|_| FetchError::DownloaderMissing(self.config.downloader_bin.clone()))?;

        ctx.report_stage(ProgressStage::Downloading, 2.0, "Probing available formats");
        let mut quality = self.pre_probe(source).await;
        if let Some(q) = &quality {
            ctx.report(Progress {
                stage: ProgressStage::Downloading,
                percentage: PROBE_SHARE,
                message: "Selected download format".to_string(),
                egress_attempts: Vec::new(),
                selected_quality: Some(q.clone()),
            });
        }

        let identities = self.egress.list().await;
        let total = identities.len().max(1);
        let mut attempts: Vec<EgressAttempt> = Vec::with_capacity(total);

        for (idx, identity) in identities.iter().enumerate() {
            ctx.check_cancelled()?;

            let attempt = EgressAttempt::begin(identity.url.clone(), (idx + 1) as u32);
            let prefix = format!("{}-", nonce());

            info!(
                identity = %identity.id,
                attempt = idx + 1,
                total,
                "Starting platform download attempt"
            );

            let outcome = self
                .run_download(source, identity.url.as_str(), &prefix, idx, total, &mut quality, &attempts, ctx)
                .await?;

            match outcome {
                DownloadOutcome::Success { path, size } => {
                    let attempt = attempt.succeed();
                    self.egress
                        .report_result(&identity.url, true, attempt.response_ms);
                    attempts.push(attempt);

                    let file_name = spec
                        .file_name
                        .clone()
                        .or_else(|| {
                            path.file_name()
                                .map(|n| n.to_string_lossy().trim_start_matches(&prefix).to_string())
                        })
                        .unwrap_or_else(|| format!("{}.mp4", nonce()));

                    ctx.report(Progress {
                        stage: ProgressStage::Downloading,
                        percentage: DOWNLOAD_CLAMP,
                        message: "Download complete".to_string(),
                        egress_attempts: attempts.clone(),
                        selected_quality: quality.clone(),
                    });

                    let mut fetched = FetchedFile::new(path, file_name, size);
                    fetched.egress_attempts = attempts;
                    fetched.selected_quality = quality;
                    return Ok(fetched);
                }
                DownloadOutcome::TimedOut => {
                    let attempt = attempt.fail(format!(
                        "timed out after {} seconds",
                        self.config.child_timeout.as_secs()
                    ));
                    self.egress
                        .report_result(&identity.url, false, attempt.response_ms);
                    attempts.push(attempt);
                    self.cleanup_fragments(&ctx.temp_dir, &prefix).await;
                    warn!(identity = %identity.id, "Platform download timed out, rotating");
                }
                DownloadOutcome::Failed { message, kind } => {
                    let attempt = attempt.fail(message.clone());
                    self.egress
                        .report_result(&identity.url, false, attempt.response_ms);
                    attempts.push(attempt);
                    self.cleanup_fragments(&ctx.temp_dir, &prefix).await;

                    // A permanent source error will not improve through
                    // another identity.
                    if let Some(kind) = kind {
                        if !kind.is_retryable() {
                            ctx.report(Progress {
                                stage: ProgressStage::Downloading,
                                percentage: 0.0,
                                message: message.clone(),
                                egress_attempts: attempts,
                                selected_quality: quality,
                            });
                            return Err(match kind {
                                FailureKind::SourceNotFound => FetchError::not_found(message),
                                FailureKind::SourceDenied => FetchError::access_denied(message),
                                FailureKind::SourceInvalid => FetchError::invalid_source(message),
                                _ => FetchError::unavailable(message),
                            });
                        }
                    }
                    warn!(identity = %identity.id, error = %message, "Platform download failed, rotating");
                }
            }

            ctx.report(Progress {
                stage: ProgressStage::Downloading,
                percentage: PROBE_SHARE + ((idx + 1) as f64 / total as f64) * ROTATION_SHARE,
                message: format!("Egress identity {}/{} failed, rotating", idx + 1, total),
                egress_attempts: attempts.clone(),
                selected_quality: quality.clone(),
            });
        }

        Err(FetchError::EgressExhausted(format!(
            "{} identities tried",
            attempts.len()
        )))
    }

    /// One pre-probe invocation printing
    /// `format_id|resolution|fps|vcodec|acodec|note`.
    async fn pre_probe(&self, source: &str) -> Option<SelectedQuality> {
        let selector = self.config.format_selector();
        let output = tokio::time::timeout(
            self.config.probe_timeout,
            Command::new(&self.config.downloader_bin)
                .args([
                    "--no-warnings",
                    "--simulate",
                    "--print",
                    "%(format_id)s|%(resolution)s|%(fps)s|%(vcodec)s|%(acodec)s|%(format_note)s",
                    "-f",
                    selector.as_str(),
                    source,
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let quality = stdout.lines().next().and_then(parse_probe_line);
                debug!(quality = ?quality, "Pre-probe result");
                quality
            }
            Ok(Ok(output)) => {
                debug!(status = ?output.status, "Pre-probe exited non-zero");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Pre-probe failed to spawn");
                None
            }
            Err(_) => {
                debug!("Pre-probe timed out");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_download(
        &self,
        source: &str,
        proxy_url: &str,
        prefix: &str,
        identity_index: usize,
        identity_total: usize,
        quality: &mut Option<SelectedQuality>,
        attempts: &[EgressAttempt],
        ctx: &FetchContext,
    ) -> FetchResult<DownloadOutcome> {
        let selector = self.config.format_selector();
        let output_template = ctx
            .temp_dir
            .join(format!("{}%(title).80s.%(ext)s", prefix))
            .to_string_lossy()
            .into_owned();

        // Everything matching the prefix is ours to clean up, fragments
        // included, so register before spawning.
        ctx.track_temp_file(&ctx.temp_dir.join(format!("{}*", prefix))).await;

        let mut command = Command::new(&self.config.downloader_bin);
        command
            .args(["--newline", "--no-playlist", "--no-warnings"])
            .args(["-f", selector.as_str()])
            .args(["--merge-output-format", "mp4"])
            .args(["-o", output_template.as_str()]);
        if !proxy_url.is_empty() {
            command.args(["--proxy", proxy_url]);
        }
        command
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if collected.len() < 16 * 1024 {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let rotation_floor =
            PROBE_SHARE + (identity_index as f64 / identity_total as f64) * ROTATION_SHARE;

        let mut lines = BufReader::new(stdout).lines();
        let mut last_reported = 0.0f64;

        let read_result = tokio::time::timeout(self.config.child_timeout, async {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(pct) = parse_progress_percent(&line) {
                                    let overall = (rotation_floor + pct * DOWNLOAD_SHARE)
                                        .min(DOWNLOAD_CLAMP);
                                    if overall - last_reported >= 0.1 {
                                        last_reported = overall;
                                        ctx.report(Progress {
                                            stage: ProgressStage::Downloading,
                                            percentage: overall,
                                            message: format!(
                                                "Downloading via egress identity {}/{}",
                                                identity_index + 1,
                                                identity_total
                                            ),
                                            egress_attempts: attempts.to_vec(),
                                            selected_quality: quality.clone(),
                                        });
                                    }
                                }
                                let observed = harvest_quality(&line);
                                match quality {
                                    Some(q) => q.merge_missing(&observed),
                                    None if observed != SelectedQuality::default() => {
                                        *quality = Some(observed);
                                    }
                                    None => {}
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return Err(FetchError::Io(e)),
                        }
                    }
                }
            }
            Ok(())
        })
        .await;

        match read_result {
            Err(_elapsed) => {
                self.terminate_child(&mut child).await;
                stderr_task.abort();
                return Ok(DownloadOutcome::TimedOut);
            }
            Ok(Err(FetchError::Cancelled)) => {
                self.terminate_child(&mut child).await;
                stderr_task.abort();
                self.cleanup_fragments(&ctx.temp_dir, prefix).await;
                return Err(FetchError::Cancelled);
            }
            Ok(Err(e)) => {
                self.terminate_child(&mut child).await;
                stderr_task.abort();
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let message = stderr_text
                .lines()
                .last()
                .unwrap_or("downloader exited non-zero")
                .to_string();
            let kind = FailureKind::classify_stderr(&stderr_text);
            return Ok(DownloadOutcome::Failed { message, kind });
        }

        match self.find_output_file(&ctx.temp_dir, prefix).await? {
            Some((path, size)) if size >= MIN_VIDEO_BYTES => {
                info!(
                    path = %path.display(),
                    size_mb = size as f64 / 1_048_576.0,
                    "Platform download produced a valid file"
                );
                Ok(DownloadOutcome::Success { path, size })
            }
            Some((path, size)) => {
                warn!(
                    path = %path.display(),
                    size,
                    min = MIN_VIDEO_BYTES,
                    "Downloaded file below minimum video size"
                );
                Ok(DownloadOutcome::Failed {
                    message: format!("downloaded file is only {} bytes", size),
                    kind: None,
                })
            }
            None => Ok(DownloadOutcome::Failed {
                message: "downloader exited zero but produced no file".to_string(),
                kind: None,
            }),
        }
    }

    /// SIGTERM with a short grace, then SIGKILL.
    async fn terminate_child(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await
                .ok();
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
        child.start_kill().ok();
        child.wait().await.ok();
    }

    /// Locate the produced file: prefix match, fragment files excluded,
    /// largest wins.
    async fn find_output_file(
        &self,
        dir: &std::path::Path,
        prefix: &str,
    ) -> FetchResult<Option<(PathBuf, u64)>> {
        let mut best: Option<(PathBuf, u64)> = None;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) || is_fragment_file(&name) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            if best.as_ref().map(|(_, s)| size > *s).unwrap_or(true) {
                best = Some((entry.path(), size));
            }
        }
        Ok(best)
    }

    /// Remove every file left behind by a failed attempt.
    async fn cleanup_fragments(&self, dir: &std::path::Path, prefix: &str) {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                debug!(file = %name, "Removing leftover download fragment");
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }
    }
}

/// Partial or fragment files the downloader produces mid-flight.
pub fn is_fragment_file(name: &str) -> bool {
    FRAGMENT_SUFFIXES.iter().any(|s| name.ends_with(s))
        || name.contains(".part-")
        || name.contains("part-Frag")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_detection() {
        assert!(is_fragment_file("abc-video.mp4.part"));
        assert!(is_fragment_file("abc-video.mp4.ytdl"));
        assert!(is_fragment_file("abc-video.temp"));
        assert!(is_fragment_file("abc-video.mp4.part-Frag12"));
        assert!(is_fragment_file("abc-video.f137.mp4.part-1"));
        assert!(!is_fragment_file("abc-video.mp4"));
        assert!(!is_fragment_file("abc-participants.mp4"));
    }

    #[test]
    fn format_selector_caps_height_and_excludes_codecs() {
        let config = PlatformConfig::default();
        let selector = config.format_selector();
        assert!(selector.contains("height<=1080"));
        assert!(selector.contains("vcodec!*=av01"));
        assert!(selector.contains("HDR"));
    }

    #[test]
    fn progress_rescale_stays_clamped() {
        // identity 2 of 3 at 100% download lands below the clamp
        let rotation_floor = PROBE_SHARE + (1.0 / 3.0) * ROTATION_SHARE;
        let overall: f64 = (rotation_floor + 100.0 * DOWNLOAD_SHARE).min(DOWNLOAD_CLAMP);
        assert!(overall <= DOWNLOAD_CLAMP);
        assert!(overall > 85.0);
    }
}
