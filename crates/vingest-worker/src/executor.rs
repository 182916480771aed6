//! Job executor: leases jobs, runs them under a concurrency cap, keeps
//! heartbeats flowing and shuts down cleanly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vingest_models::JobId;

use crate::pipeline::{run_import, WorkerContext};
use crate::recovery::{mark_inflight_stalled, startup_sweep};
use crate::error::WorkerResult;

/// Poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Import job executor.
pub struct ImportExecutor {
    ctx: Arc<WorkerContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
    inflight: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl ImportExecutor {
    /// Create a new executor.
    pub fn new(ctx: WorkerContext) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(ctx.config.concurrency));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());
        Self {
            ctx: Arc::new(ctx),
            job_semaphore,
            shutdown,
            consumer_name,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the executor. Returns when shutdown has been signalled and
    /// in-flight jobs have drained (or the drain budget expired).
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            consumer = %self.consumer_name,
            concurrency = self.ctx.config.concurrency,
            "Starting import executor"
        );

        tokio::fs::create_dir_all(&self.ctx.config.temp_dir).await?;

        // Reconcile whatever a previous process left behind.
        startup_sweep(&self.ctx.queue, &self.ctx.recovery).await;

        let mut shutdown_rx = self.shutdown.subscribe();

        // Dispatcher maintenance: re-arm delayed jobs, count stalls,
        // collect expired terminal jobs.
        let maintenance = {
            let queue = Arc::clone(&self.ctx.queue);
            let interval = self.ctx.config.cleanup_interval;
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            if let Err(e) = queue.run_maintenance().await {
                                warn!(error = %e, "Queue maintenance tick failed");
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping lease loop");
                        break;
                    }
                }
                result = self.lease_one() => {
                    if let Err(e) = result {
                        error!(error = %e, "Lease cycle failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        maintenance.abort();
        self.drain().await;
        info!("Import executor stopped");
        Ok(())
    }

    /// Lease and spawn at most one job; sleeps briefly when idle.
    async fn lease_one(&self) -> WorkerResult<()> {
        let permit = self
            .job_semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let Some(job) = self.ctx.queue.lease(&self.consumer_name).await? else {
            drop(permit);
            tokio::time::sleep(IDLE_POLL).await;
            return Ok(());
        };

        let job_id = job.id().clone();
        let cancel = CancellationToken::new();
        self.inflight
            .lock()
            .await
            .insert(job_id.clone(), cancel.clone());

        let heartbeat = self.spawn_heartbeat(job_id.clone(), cancel.clone());

        let ctx = Arc::clone(&self.ctx);
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            let _permit = permit;
            run_import(ctx, job, cancel).await;
            heartbeat.abort();
            inflight.lock().await.remove(&job_id);
        });

        Ok(())
    }

    /// Per-job heartbeat: renews the lease, refreshes the mirror and
    /// watches for `kill_active`.
    fn spawn_heartbeat(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.ctx.queue);
        let recovery = Arc::clone(&self.ctx.recovery);
        let interval = self.ctx.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = queue.extend_lease(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Lease renewal failed");
                }
                recovery.heartbeat(&job_id).await.ok();
                match queue.is_cancelled(&job_id).await {
                    Ok(true) => {
                        debug!(job_id = %job_id, "Kill flag observed, cancelling job");
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "Cancel check failed"),
                }
            }
        })
    }

    /// Wait for in-flight jobs; whatever is still running when the
    /// budget expires gets cancelled and marked stalled.
    async fn drain(&self) {
        info!("Waiting for in-flight jobs to complete…");
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_timeout;
        loop {
            if self.inflight.lock().await.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let remaining: Vec<JobId> = {
            let inflight = self.inflight.lock().await;
            for token in inflight.values() {
                token.cancel();
            }
            inflight.keys().cloned().collect()
        };
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "Cancelling jobs that outlived the drain budget");
            mark_inflight_stalled(&self.ctx.recovery, &remaining).await;
            // Give the cancelled pipelines a moment to write their
            // mirror state.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
