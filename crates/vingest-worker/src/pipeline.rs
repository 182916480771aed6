//! The per-job import pipeline: fetch, upload, notify, clean up.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vingest_fetch::{FetchContext, SourceFetcher};
use vingest_models::{
    object_name_with_nonce, ImportJob, ImportResult, JobState, Progress, ProgressStage,
};
use vingest_origin::OriginClient;
use vingest_queue::{ImportQueue, RecoveryStore};

use crate::catalog::CatalogClient;
use crate::config::ImportConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::recovery::remove_temp_files;

/// Shared services a worker needs to run jobs.
pub struct WorkerContext {
    pub queue: Arc<ImportQueue>,
    pub recovery: Arc<RecoveryStore>,
    pub fetcher: Arc<SourceFetcher>,
    pub origin: Arc<OriginClient>,
    pub catalog: Arc<CatalogClient>,
    pub config: ImportConfig,
}

/// Run one leased job to its terminal state. Every exit path cleans up
/// temp files and updates the recovery mirror; `complete`/`fail` fire
/// exactly once (and no-op against a killed job).
pub async fn run_import(ctx: Arc<WorkerContext>, job: ImportJob, cancel: CancellationToken) {
    let job_id = job.id().clone();
    let logger = JobLogger::new(&job_id, "import");
    logger.log_start(&format!(
        "{} from {}",
        job.spec.source_kind, job.spec.source_ref
    ));

    let record = vingest_models::RecoveryRecord::open(job_id.clone(), job.spec.clone());
    if let Err(e) = ctx.recovery.open(record).await {
        warn!(job_id = %job_id, error = %e, "Could not open recovery record");
    }

    // Progress flows through an unbounded channel so producers never
    // block; a forwarder task persists snapshots to the queue and the
    // recovery mirror.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Progress>();
    let forwarder = {
        let queue = Arc::clone(&ctx.queue);
        let recovery = Arc::clone(&ctx.recovery);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                queue.report_progress(&job_id, update.clone()).await.ok();
                recovery.update_progress(&job_id, update).await.ok();
            }
        })
    };

    let temp_files: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let fetch_ctx = {
        let progress_tx = progress_tx.clone();
        let recovery = Arc::clone(&ctx.recovery);
        let registry = Arc::clone(&temp_files);
        let job_id_for_temp = job_id.clone();
        FetchContext::new(
            PathBuf::from(&ctx.config.temp_dir),
            ctx.config.max_file_size,
            ctx.config.download_timeout,
            cancel.clone(),
            Arc::new(move |p: Progress| {
                progress_tx.send(p).ok();
            }),
            Arc::new(
                move |path: PathBuf| -> futures_util::future::BoxFuture<'static, ()> {
                    let recovery = Arc::clone(&recovery);
                    let registry = Arc::clone(&registry);
                    let job_id = job_id_for_temp.clone();
                    Box::pin(async move {
                        let path = path.to_string_lossy().into_owned();
                        registry.lock().await.push(path.clone());
                        recovery.track_temp_file(&job_id, &path).await.ok();
                    })
                },
            ),
        )
    };

    progress_tx
        .send(Progress::stage(
            ProgressStage::Downloading,
            0.0,
            "Starting download…",
        ))
        .ok();

    let outcome = execute(&ctx, &job, &fetch_ctx, &progress_tx).await;

    match outcome {
        Ok(result) => {
            progress_tx
                .send(Progress::stage(
                    ProgressStage::Cleanup,
                    100.0,
                    "Cleaning up",
                ))
                .ok();
            if let Err(e) = ctx.queue.complete(&job_id, result.clone()).await {
                warn!(job_id = %job_id, error = %e, "Failed to record completion");
            }
            // A racing kill leaves the job terminal-failed; the catalog
            // must not hear of success then.
            let completed = matches!(
                ctx.queue.get(&job_id).await,
                Ok(Some(stored)) if stored.status == JobState::Completed
            );
            if completed {
                ctx.catalog.notify_success(&job, &result).await;
                logger.log_completion(&format!("{} ({} bytes)", result.cdn_url, result.size));
            } else {
                logger.log_warning("job was killed before completion was recorded");
            }
            cleanup_temp_files(&ctx, &job_id, &temp_files).await;
            ctx.recovery.remove(&job_id).await.ok();
        }
        Err(e) if e.is_cancellation() => {
            let killed = ctx.queue.is_cancelled(&job_id).await.unwrap_or(false);
            if killed {
                // Manual kill: reclaim temp files, keep the catalog out
                // of it.
                cleanup_temp_files(&ctx, &job_id, &temp_files).await;
                ctx.recovery.remove(&job_id).await.ok();
                logger.log_warning("job killed, temp files reclaimed");
            } else {
                // Shutdown: leave files on disk, mark the mirror so the
                // next startup inherits them.
                ctx.recovery
                    .set_status(&job_id, vingest_models::RecoveryStatus::Stalled)
                    .await
                    .ok();
                logger.log_warning("shutdown mid-job, marked stalled for recovery");
            }
        }
        Err(e) => {
            let kind = e.kind();
            let reason = format!("{}: {}", kind, e);
            let retryable = e.is_retryable();
            logger.log_error(&reason);

            cleanup_temp_files(&ctx, &job_id, &temp_files).await;
            if let Err(fail_err) = ctx.queue.fail(&job_id, &reason, retryable).await {
                warn!(job_id = %job_id, error = %fail_err, "Failed to record failure");
            }
            ctx.recovery
                .set_status(&job_id, vingest_models::RecoveryStatus::Failed)
                .await
                .ok();

            // The catalog hears only of terminal failures.
            if let Ok(Some(stored)) = ctx.queue.get(&job_id).await {
                if stored.status == JobState::Failed
                    && stored.failure_reason.as_deref() != Some("manually killed")
                {
                    ctx.catalog.notify_failure(&stored, &reason).await;
                }
            }
        }
    }

    drop(fetch_ctx);
    drop(progress_tx);
    forwarder.await.ok();
}

/// The happy-path pipeline body; any error bubbles to the caller's
/// classification.
async fn execute(
    ctx: &Arc<WorkerContext>,
    job: &ImportJob,
    fetch_ctx: &FetchContext,
    progress_tx: &mpsc::UnboundedSender<Progress>,
) -> WorkerResult<ImportResult> {
    let fetched = ctx.fetcher.fetch(&job.spec, fetch_ctx).await?;
    debug!(
        job_id = %job.id(),
        file = %fetched.local_path.display(),
        size = fetched.size,
        "Fetch complete"
    );

    fetch_ctx.check_cancelled().map_err(WorkerError::from)?;

    let object_name = object_name_with_nonce(&fetched.file_name);
    progress_tx
        .send(Progress::stage(
            ProgressStage::Uploading,
            0.0,
            format!("Uploading {}", object_name),
        ))
        .ok();

    let upload_progress = {
        let progress_tx = progress_tx.clone();
        let object_name = object_name.clone();
        Arc::new(move |sent: u64, total: u64| {
            let percentage = if total > 0 {
                (sent as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            progress_tx
                .send(Progress::stage(
                    ProgressStage::Uploading,
                    percentage,
                    format!("Uploading {}", object_name),
                ))
                .ok();
        }) as vingest_origin::UploadProgress
    };

    let size = ctx
        .origin
        .put_file(&fetched.local_path, &object_name, upload_progress)
        .await?;

    fetch_ctx.check_cancelled().map_err(WorkerError::from)?;

    if !ctx.origin.verify_cdn_access(&object_name).await {
        info!(object = %object_name, "CDN verification negative, continuing anyway");
    }

    Ok(ImportResult {
        cdn_url: ctx.origin.cdn_url(&object_name),
        file_name: object_name,
        size,
        attempts_made: job.attempts_made,
        egress_attempts: fetched.egress_attempts,
    })
}

/// Remove everything this job owns: paths registered locally during
/// this attempt plus anything the mirror carried over from earlier
/// attempts.
async fn cleanup_temp_files(
    ctx: &Arc<WorkerContext>,
    job_id: &vingest_models::JobId,
    registry: &Arc<Mutex<Vec<String>>>,
) {
    let mut paths = registry.lock().await.clone();
    if let Ok(Some(record)) = ctx.recovery.get(job_id).await {
        for path in record.temp_files {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    remove_temp_files(&paths).await;
}
