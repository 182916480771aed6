//! Crash recovery and graceful shutdown.
//!
//! On startup, stale mirror records are swept: temp files of dead jobs
//! are removed and recoverable jobs are re-queued. On shutdown, every
//! in-flight job is marked stalled so the next start inherits it.

use std::path::Path;

use tracing::{info, warn};

use vingest_models::{JobId, JobState, RecoveryStatus};
use vingest_queue::{ImportQueue, RecoveryStore};

/// Heartbeat age after which a mirror record counts as stale.
const STALE_THRESHOLD_SECS: i64 = 300;

/// Result of a startup sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub purged: usize,
    pub retried: usize,
}

/// Scan recovery records and reconcile them with the queue.
///
/// - terminal or vanished jobs: remove temp files and the record
/// - active/waiting/delayed jobs: leave them, the queue's own stall
///   accounting owns them
/// - failed jobs and records marked stalled by a previous shutdown:
///   clean up and re-queue
pub async fn startup_sweep(queue: &ImportQueue, store: &RecoveryStore) -> SweepReport {
    let mut report = SweepReport::default();

    let records = match store.list_all().await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Recovery sweep could not list records");
            return report;
        }
    };

    for record in records {
        report.scanned += 1;
        let stalled_by_shutdown = record.status == RecoveryStatus::Stalled;
        if !stalled_by_shutdown && !record.is_stale(STALE_THRESHOLD_SECS) {
            continue;
        }
        let job_id = record.job_id.clone();

        let job = match queue.get(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Recovery sweep could not load job");
                continue;
            }
        };

        match job {
            None => {
                remove_temp_files(&record.temp_files).await;
                store.remove(&job_id).await.ok();
                report.purged += 1;
                info!(job_id = %job_id, "Purged recovery record for vanished job");
            }
            Some(job) if job.is_terminal() => {
                remove_temp_files(&record.temp_files).await;
                store.remove(&job_id).await.ok();
                report.purged += 1;
                if job.status == JobState::Failed && stalled_by_shutdown {
                    if let Err(e) = queue.retry(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Recovery retry failed");
                    } else {
                        report.retried += 1;
                        info!(job_id = %job_id, "Re-queued failed job from recovery");
                    }
                }
            }
            Some(job) if job.status == JobState::Active => {
                // Stalled by our own shutdown, or active with a dead
                // lease after a crash: either way no live worker owns
                // it. A job still leased by another worker is left
                // alone.
                let orphaned = stalled_by_shutdown
                    || !queue.has_live_lease(&job_id).await.unwrap_or(true);
                if !orphaned {
                    continue;
                }
                remove_temp_files(&record.temp_files).await;
                store.remove(&job_id).await.ok();
                if let Err(e) = reclaim_active(queue, &job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to reclaim stalled job");
                } else {
                    report.retried += 1;
                    info!(job_id = %job_id, "Re-queued job with no live worker");
                }
            }
            Some(_) => {
                // Waiting or delayed: the dispatcher owns the schedule.
            }
        }
    }

    info!(
        scanned = report.scanned,
        purged = report.purged,
        retried = report.retried,
        "Recovery sweep complete"
    );
    report
}

async fn reclaim_active(queue: &ImportQueue, job_id: &JobId) -> vingest_queue::QueueResult<()> {
    queue
        .fail(job_id, "worker shut down mid-flight", true)
        .await?;
    if let Some(job) = queue.get(job_id).await? {
        if job.status == JobState::Delayed || job.status == JobState::Failed {
            queue.retry(job_id).await?;
        }
    }
    Ok(())
}

/// Mark every given in-flight job stalled in the mirror so the next
/// startup picks it up.
pub async fn mark_inflight_stalled(store: &RecoveryStore, job_ids: &[JobId]) {
    for job_id in job_ids {
        if let Err(e) = store.set_status(job_id, RecoveryStatus::Stalled).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark job stalled");
        }
    }
    if !job_ids.is_empty() {
        info!(count = job_ids.len(), "Marked in-flight jobs stalled for next startup");
    }
}

/// Remove tracked temp paths. A trailing `*` marks a prefix entry that
/// also covers fragment files.
pub async fn remove_temp_files(paths: &[String]) {
    for path in paths {
        remove_temp_path(path).await;
    }
}

pub async fn remove_temp_path(path: &str) {
    if let Some(prefix_path) = path.strip_suffix('*') {
        let prefix_path = Path::new(prefix_path);
        let Some(dir) = prefix_path.parent() else { return };
        let Some(prefix) = prefix_path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return;
        };
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                tokio::fs::remove_file(entry.path()).await.ok();
                info!(file = %entry.path().display(), "Removed orphaned temp file");
            }
        }
    } else if tokio::fs::remove_file(path).await.is_ok() {
        info!(file = path, "Removed orphaned temp file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_plain_paths_and_prefix_globs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("job-video.mp4");
        let frag1 = dir.path().join("abc123-video.mp4.part");
        let frag2 = dir.path().join("abc123-video.f137.mp4");
        let other = dir.path().join("keepme.mp4");
        for f in [&plain, &frag1, &frag2, &other] {
            tokio::fs::write(f, b"x").await.expect("write");
        }

        remove_temp_files(&[
            plain.to_string_lossy().into_owned(),
            format!("{}/abc123-*", dir.path().display()),
        ])
        .await;

        assert!(!plain.exists());
        assert!(!frag1.exists());
        assert!(!frag2.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn missing_files_are_ignored() {
        remove_temp_files(&["/nonexistent/vingest-test.mp4".to_string()]).await;
    }
}
