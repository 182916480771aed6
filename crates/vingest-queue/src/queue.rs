//! Durable import job queue on Redis.
//!
//! Jobs are stored as JSON values keyed by request id; each state has
//! its own sorted set so leasing pops FIFO from `waiting` and listings
//! read newest-first from a global index. All transitions are persisted
//! before the call returns.

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use vingest_models::{ImportJob, ImportResult, ImportSpec, JobId, JobState, Progress};

use crate::error::{QueueError, QueueResult};

const NS: &str = "queue:import";

/// Cap on per-job log entries.
const MAX_JOB_LOGS: isize = 200;

/// How long a kill flag stays observable.
const CANCEL_FLAG_TTL_SECS: u64 = 3600;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Default max attempts for submitted jobs
    pub max_attempts: u32,
    /// Base delay for retry backoff
    pub backoff_base: Duration,
    /// Backoff multiplier per attempt
    pub backoff_multiplier: f64,
    /// Cap on the retry delay
    pub backoff_max: Duration,
    /// Lease duration for active jobs (renewed by heartbeats)
    pub lock_duration: Duration,
    /// Heartbeat age after which a lease counts as a stall observation
    pub stalled_interval: Duration,
    /// Stall observations before a job is forced off its worker
    pub max_stalled_count: u32,
    /// Retention for completed jobs
    pub completed_ttl: Duration,
    /// Newest completed jobs kept regardless of TTL pressure
    pub completed_keep: usize,
    /// Retention for failed jobs
    pub failed_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(30),
            lock_duration: Duration::from_secs(2 * 3600),
            stalled_interval: Duration::from_secs(60),
            max_stalled_count: 5,
            completed_ttl: Duration::from_secs(24 * 3600),
            completed_keep: 100,
            failed_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            max_attempts: std::env::var("MAX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            lock_duration: Duration::from_millis(
                std::env::var("JOB_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.lock_duration.as_millis() as u64),
            ),
            ..defaults
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable import queue client.
#[derive(Clone)]
pub struct ImportQueue {
    client: redis::Client,
    config: QueueConfig,
}

fn job_key(id: &JobId) -> String {
    format!("{NS}:job:{id}")
}

fn logs_key(id: &JobId) -> String {
    format!("{NS}:logs:{id}")
}

fn lease_key(id: &JobId) -> String {
    format!("{NS}:lease:{id}")
}

fn cancel_key(id: &JobId) -> String {
    format!("{NS}:cancel:{id}")
}

fn stalls_key(id: &JobId) -> String {
    format!("{NS}:stalls:{id}")
}

fn state_key(state: JobState) -> String {
    format!("{NS}:{}", state.as_str())
}

fn index_key() -> String {
    format!("{NS}:index")
}

fn paused_key() -> String {
    format!("{NS}:paused")
}

impl ImportQueue {
    /// Create a new queue client.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
    ) -> QueueResult<Option<ImportJob>> {
        let raw: Option<String> = conn.get(job_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &ImportJob,
    ) -> QueueResult<()> {
        let json = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(job_key(job.id()), json).await?;
        Ok(())
    }

    /// Submit a job. Idempotent by request id: while a job with that id
    /// exists, the existing job is returned instead of a new one.
    pub async fn submit(&self, spec: ImportSpec) -> QueueResult<ImportJob> {
        let mut conn = self.conn().await?;
        let id = spec.request_id.clone();

        if let Some(existing) = self.load(&mut conn, &id).await? {
            if !existing.is_terminal() {
                debug!(job_id = %id, "Submit matched existing non-terminal job");
                return Ok(existing);
            }
            // Terminal leftovers are replaced by the fresh submission.
            self.purge_job(&mut conn, &existing).await?;
        }

        let job = ImportJob::new(spec, self.config.max_attempts);
        let now_ms = Utc::now().timestamp_millis();

        self.save(&mut conn, &job).await?;
        conn.zadd::<_, _, _, ()>(state_key(JobState::Waiting), id.as_str(), now_ms)
            .await?;
        conn.zadd::<_, _, _, ()>(index_key(), id.as_str(), now_ms)
            .await?;
        self.append_log(&id, "submitted").await.ok();

        info!(job_id = %id, source_kind = %job.spec.source_kind, "Enqueued import job");
        Ok(job)
    }

    /// Lease the oldest waiting job for a worker. Returns `None` when
    /// the queue is paused or empty.
    pub async fn lease(&self, worker_id: &str) -> QueueResult<Option<ImportJob>> {
        let mut conn = self.conn().await?;

        let paused: bool = conn.exists(paused_key()).await?;
        if paused {
            return Ok(None);
        }

        let popped: Vec<(String, f64)> = conn.zpopmin(state_key(JobState::Waiting), 1).await?;
        let Some((id_str, _)) = popped.into_iter().next() else {
            return Ok(None);
        };
        let id = JobId::from_string(id_str);

        let Some(job) = self.load(&mut conn, &id).await? else {
            warn!(job_id = %id, "Waiting entry had no job record, dropping");
            return Ok(None);
        };

        let job = job.start();
        self.save(&mut conn, &job).await?;
        conn.zadd::<_, _, _, ()>(
            state_key(JobState::Active),
            id.as_str(),
            Utc::now().timestamp_millis(),
        )
        .await?;
        conn.set::<_, _, ()>(lease_key(&id), worker_id).await?;
        conn.pexpire::<_, ()>(lease_key(&id), self.config.lock_duration.as_millis() as i64)
            .await?;
        conn.del::<_, ()>(stalls_key(&id)).await?;
        self.append_log(&id, format!("leased by {}", worker_id)).await.ok();

        info!(job_id = %id, worker_id = worker_id, "Leased job");
        Ok(Some(job))
    }

    /// Renew the lease of an active job. Also clears pending stall
    /// observations, so calling this doubles as the queue-side
    /// heartbeat.
    pub async fn extend_lease(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let extended: bool = conn
            .pexpire(lease_key(id), self.config.lock_duration.as_millis() as i64)
            .await?;
        if extended {
            conn.del::<_, ()>(stalls_key(id)).await?;
        }
        Ok(())
    }

    /// Whether `kill_active` has been called for this job.
    pub async fn is_cancelled(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(cancel_key(id)).await?)
    }

    /// Whether some worker still holds an unexpired lease on this job.
    pub async fn has_live_lease(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let ttl_ms: i64 = conn.pttl(lease_key(id)).await?;
        Ok(ttl_ms > 0)
    }

    /// Persist a progress snapshot for an active job. Percentage is
    /// clamped to be non-decreasing within the attempt.
    pub async fn report_progress(&self, id: &JobId, update: Progress) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Err(QueueError::job_not_found(id.as_str()));
        };
        if job.status != JobState::Active {
            debug!(job_id = %id, status = %job.status, "Dropping progress for non-active job");
            return Ok(());
        }
        job.progress.apply(update);
        self.save(&mut conn, &job).await?;
        Ok(())
    }

    /// Complete an active job. A no-op when the job already reached a
    /// terminal state (e.g. it was killed while the worker finished).
    pub async fn complete(&self, id: &JobId, result: ImportResult) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let Some(job) = self.load(&mut conn, id).await? else {
            return Err(QueueError::job_not_found(id.as_str()));
        };
        if job.is_terminal() {
            warn!(job_id = %id, status = %job.status, "Ignoring complete() on terminal job");
            return Ok(());
        }

        let job = job.complete(result);
        self.save(&mut conn, &job).await?;
        self.move_state(&mut conn, id, JobState::Completed).await?;
        conn.del::<_, ()>(lease_key(id)).await?;
        conn.del::<_, ()>(cancel_key(id)).await?;
        self.append_log(id, "completed").await.ok();

        info!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Fail an active job. Retryable failures with attempts remaining
    /// are parked in the delayed set with exponential backoff;
    /// everything else becomes terminal. No-op on terminal jobs.
    pub async fn fail(&self, id: &JobId, reason: &str, retryable: bool) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let Some(job) = self.load(&mut conn, id).await? else {
            return Err(QueueError::job_not_found(id.as_str()));
        };
        if job.is_terminal() {
            warn!(job_id = %id, status = %job.status, "Ignoring fail() on terminal job");
            return Ok(());
        }

        let job = job.fail(reason, retryable);
        self.save(&mut conn, &job).await?;
        conn.del::<_, ()>(lease_key(id)).await?;
        conn.zrem::<_, _, ()>(state_key(JobState::Active), id.as_str())
            .await?;
        conn.zrem::<_, _, ()>(state_key(JobState::Waiting), id.as_str())
            .await?;

        match job.status {
            JobState::Delayed => {
                let delay = self.retry_delay(job.attempts_made);
                let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                conn.zadd::<_, _, _, ()>(state_key(JobState::Delayed), id.as_str(), visible_at)
                    .await?;
                self.append_log(
                    id,
                    format!(
                        "attempt {} failed ({}), retrying in {:?}",
                        job.attempts_made, reason, delay
                    ),
                )
                .await
                .ok();
                info!(job_id = %id, attempts = job.attempts_made, delay_secs = delay.as_secs(), "Job delayed for retry");
            }
            _ => {
                conn.zadd::<_, _, _, ()>(
                    state_key(JobState::Failed),
                    id.as_str(),
                    Utc::now().timestamp_millis(),
                )
                .await?;
                self.append_log(id, format!("failed terminally: {}", reason))
                    .await
                    .ok();
                warn!(job_id = %id, attempts = job.attempts_made, reason = reason, "Job failed terminally");
            }
        }
        Ok(())
    }

    /// Backoff before attempt `attempts_made + 1`:
    /// `base * multiplier^(attempts_made - 1)` capped at the maximum.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        let factor = self.config.backoff_multiplier.powi(exponent as i32);
        let millis = (self.config.backoff_base.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.config.backoff_max)
    }

    /// Move delayed jobs whose backoff expired back to `waiting`.
    /// Returns how many were re-armed.
    pub async fn rearm_due(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore(state_key(JobState::Delayed), 0, now_ms)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for id_str in due {
            let id = JobId::from_string(id_str);
            conn.zrem::<_, _, ()>(state_key(JobState::Delayed), id.as_str())
                .await?;
            let Some(job) = self.load(&mut conn, &id).await? else {
                continue;
            };
            if job.status != JobState::Delayed {
                continue;
            }
            let job = job.rearm();
            self.save(&mut conn, &job).await?;
            conn.zadd::<_, _, _, ()>(state_key(JobState::Waiting), id.as_str(), now_ms)
                .await?;
            moved += 1;
        }

        if moved > 0 {
            info!(count = moved, "Re-armed delayed jobs");
        }
        Ok(moved)
    }

    /// Explicit re-queue of a non-active, non-completed job.
    pub async fn retry(&self, id: &JobId) -> QueueResult<ImportJob> {
        let mut conn = self.conn().await?;
        let Some(job) = self.load(&mut conn, id).await? else {
            return Err(QueueError::job_not_found(id.as_str()));
        };
        match job.status {
            JobState::Active => {
                return Err(QueueError::invalid_transition(
                    id.as_str(),
                    "cannot retry an active job",
                ))
            }
            JobState::Completed => {
                return Err(QueueError::invalid_transition(
                    id.as_str(),
                    "cannot retry a completed job",
                ))
            }
            _ => {}
        }

        conn.zrem::<_, _, ()>(state_key(job.status), id.as_str()).await?;
        conn.del::<_, ()>(cancel_key(id)).await?;
        let job = job.rearm();
        self.save(&mut conn, &job).await?;
        conn.zadd::<_, _, _, ()>(
            state_key(JobState::Waiting),
            id.as_str(),
            Utc::now().timestamp_millis(),
        )
        .await?;
        self.append_log(id, "manually retried").await.ok();

        info!(job_id = %id, "Job re-queued");
        Ok(job)
    }

    /// Force a running job to terminal-failed. The owning worker
    /// observes the cancel flag at its next suspension point; its own
    /// complete/fail calls then no-op against the terminal record.
    pub async fn kill_active(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Err(QueueError::job_not_found(id.as_str()));
        };
        if job.status != JobState::Active {
            return Err(QueueError::invalid_transition(
                id.as_str(),
                format!("job is {}, not active", job.status),
            ));
        }

        conn.set_ex::<_, _, ()>(cancel_key(id), "1", CANCEL_FLAG_TTL_SECS)
            .await?;

        job.status = JobState::Failed;
        job.failure_reason = Some("manually killed".to_string());
        job.finished_at = Some(Utc::now());
        self.save(&mut conn, &job).await?;
        self.move_state(&mut conn, id, JobState::Failed).await?;
        conn.del::<_, ()>(lease_key(id)).await?;
        self.append_log(id, "manually killed").await.ok();

        warn!(job_id = %id, "Job killed");
        Ok(())
    }

    /// Count stall observations for active jobs whose lease expired or
    /// whose heartbeat stopped; force jobs over the threshold back to
    /// `waiting` (or terminal-failed when attempts are exhausted).
    pub async fn check_stalled(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let active: Vec<String> = conn
            .zrange(state_key(JobState::Active), 0, -1)
            .await?;

        let mut forced = 0;
        for id_str in active {
            let id = JobId::from_string(id_str);

            let lease_ttl_ms: i64 = conn.pttl(lease_key(&id)).await?;
            let lock_ms = self.config.lock_duration.as_millis() as i64;
            let stalled_ms = self.config.stalled_interval.as_millis() as i64;
            // A healthy worker renews the lease every heartbeat, so the
            // remaining TTL stays close to lock_duration. A TTL that has
            // drifted by more than stalled_interval (or a missing lease)
            // means the worker went quiet.
            let heartbeat_age = if lease_ttl_ms < 0 {
                lock_ms
            } else {
                lock_ms - lease_ttl_ms
            };
            if heartbeat_age < stalled_ms {
                continue;
            }

            let observations: u32 = conn.incr(stalls_key(&id), 1).await?;
            conn.expire::<_, ()>(stalls_key(&id), 3600).await?;
            if observations < self.config.max_stalled_count {
                debug!(job_id = %id, observations, "Stall observation recorded");
                continue;
            }

            conn.del::<_, ()>(stalls_key(&id)).await?;
            self.fail(&id, "job stalled (no heartbeat)", true).await?;
            // A stalled job goes straight back to waiting rather than
            // sitting out a backoff window.
            if let Some(job) = self.get(&id).await? {
                if job.status == JobState::Delayed {
                    let mut conn2 = self.conn().await?;
                    conn2
                        .zrem::<_, _, ()>(state_key(JobState::Delayed), id.as_str())
                        .await?;
                    let job = job.rearm();
                    self.save(&mut conn2, &job).await?;
                    conn2
                        .zadd::<_, _, _, ()>(
                            state_key(JobState::Waiting),
                            id.as_str(),
                            Utc::now().timestamp_millis(),
                        )
                        .await?;
                }
            }
            forced += 1;
            warn!(job_id = %id, "Stalled job forced off its worker");
        }
        Ok(forced)
    }

    /// Garbage-collect terminal jobs past their retention.
    pub async fn gc_terminal(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut removed = 0;

        // Completed: drop past TTL, then enforce the newest-N cap.
        let completed_cutoff = now_ms - self.config.completed_ttl.as_millis() as i64;
        let expired: Vec<String> = conn
            .zrangebyscore(state_key(JobState::Completed), 0, completed_cutoff)
            .await?;
        let total: u64 = conn.zcard(state_key(JobState::Completed)).await?;
        let overflow: Vec<String> = if total as usize > self.config.completed_keep {
            let excess = total as isize - self.config.completed_keep as isize;
            conn.zrange(state_key(JobState::Completed), 0, excess - 1)
                .await?
        } else {
            Vec::new()
        };

        for id_str in expired.into_iter().chain(overflow) {
            let id = JobId::from_string(id_str);
            if let Some(job) = self.load(&mut conn, &id).await? {
                self.purge_job(&mut conn, &job).await?;
                removed += 1;
            } else {
                conn.zrem::<_, _, ()>(state_key(JobState::Completed), id.as_str())
                    .await?;
            }
        }

        // Failed: drop past TTL.
        let failed_cutoff = now_ms - self.config.failed_ttl.as_millis() as i64;
        let expired: Vec<String> = conn
            .zrangebyscore(state_key(JobState::Failed), 0, failed_cutoff)
            .await?;
        for id_str in expired {
            let id = JobId::from_string(id_str);
            if let Some(job) = self.load(&mut conn, &id).await? {
                self.purge_job(&mut conn, &job).await?;
                removed += 1;
            } else {
                conn.zrem::<_, _, ()>(state_key(JobState::Failed), id.as_str())
                    .await?;
            }
        }

        if removed > 0 {
            debug!(count = removed, "Garbage-collected terminal jobs");
        }
        Ok(removed)
    }

    /// One dispatcher tick: re-arm due retries, account for stalls,
    /// collect expired terminal jobs.
    pub async fn run_maintenance(&self) -> QueueResult<()> {
        self.rearm_due().await?;
        self.check_stalled().await?;
        self.gc_terminal().await?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get(&self, id: &JobId) -> QueueResult<Option<ImportJob>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, id).await
    }

    /// List jobs newest-first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<JobState>,
        page: usize,
        limit: usize,
    ) -> QueueResult<Vec<ImportJob>> {
        let mut conn = self.conn().await?;
        let key = match status {
            Some(state) => state_key(state),
            None => index_key(),
        };
        let start = (page * limit) as isize;
        let stop = start + limit as isize - 1;
        let ids: Vec<String> = conn.zrevrange(key, start, stop).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id_str in ids {
            if let Some(job) = self.load(&mut conn, &JobId::from_string(id_str)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Job counts per state.
    pub async fn counts_by_status(&self) -> QueueResult<StatusCounts> {
        let mut conn = self.conn().await?;
        Ok(StatusCounts {
            waiting: conn.zcard(state_key(JobState::Waiting)).await?,
            active: conn.zcard(state_key(JobState::Active)).await?,
            delayed: conn.zcard(state_key(JobState::Delayed)).await?,
            completed: conn.zcard(state_key(JobState::Completed)).await?,
            failed: conn.zcard(state_key(JobState::Failed)).await?,
        })
    }

    /// Read the capped log list of a job, oldest first.
    pub async fn logs(&self, id: &JobId) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(logs_key(id), 0, -1).await?)
    }

    /// Append a log line to a job's history.
    pub async fn append_log(&self, id: &JobId, line: impl Into<String>) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let entry = format!("{} {}", Utc::now().to_rfc3339(), line.into());
        conn.rpush::<_, _, ()>(logs_key(id), entry).await?;
        conn.ltrim::<_, ()>(logs_key(id), -MAX_JOB_LOGS, -1).await?;
        Ok(())
    }

    /// Stop handing out leases.
    pub async fn pause(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(paused_key(), "1").await?;
        info!("Queue paused");
        Ok(())
    }

    /// Resume leasing.
    pub async fn resume(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(paused_key()).await?;
        info!("Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(paused_key()).await?)
    }

    /// Remove all waiting jobs.
    pub async fn drain(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(state_key(JobState::Waiting), 0, -1).await?;
        let count = ids.len();
        for id_str in ids {
            let id = JobId::from_string(id_str);
            if let Some(job) = self.load(&mut conn, &id).await? {
                self.purge_job(&mut conn, &job).await?;
            } else {
                conn.zrem::<_, _, ()>(state_key(JobState::Waiting), id.as_str())
                    .await?;
            }
        }
        warn!(count, "Drained waiting jobs");
        Ok(count)
    }

    /// Remove every job regardless of state, plus all queue bookkeeping.
    pub async fn obliterate(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let mut removed = 0;

        let pattern = format!("{NS}:*");
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            for key in keys {
                conn.del::<_, ()>(&key).await?;
                removed += 1;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        warn!(keys = removed, "Queue obliterated");
        Ok(removed)
    }

    async fn move_state(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
        to: JobState,
    ) -> QueueResult<()> {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            if state != to {
                conn.zrem::<_, _, ()>(state_key(state), id.as_str()).await?;
            }
        }
        conn.zadd::<_, _, _, ()>(state_key(to), id.as_str(), Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    async fn purge_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &ImportJob,
    ) -> QueueResult<()> {
        let id = job.id();
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            conn.zrem::<_, _, ()>(state_key(state), id.as_str()).await?;
        }
        conn.zrem::<_, _, ()>(index_key(), id.as_str()).await?;
        conn.del::<_, ()>(job_key(id)).await?;
        conn.del::<_, ()>(logs_key(id)).await?;
        conn.del::<_, ()>(lease_key(id)).await?;
        conn.del::<_, ()>(cancel_key(id)).await?;
        conn.del::<_, ()>(stalls_key(id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let queue = ImportQueue::new(QueueConfig::default()).expect("client");
        assert_eq!(queue.retry_delay(1), Duration::from_secs(5));
        assert_eq!(queue.retry_delay(2), Duration::from_secs(10));
        assert_eq!(queue.retry_delay(3), Duration::from_secs(20));
        // base 5s * 2^3 = 40s, capped at 30s
        assert_eq!(queue.retry_delay(4), Duration::from_secs(30));
        assert_eq!(queue.retry_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn keys_are_namespaced() {
        let id = JobId::from_string("req-1");
        assert_eq!(job_key(&id), "queue:import:job:req-1");
        assert_eq!(lease_key(&id), "queue:import:lease:req-1");
        assert_eq!(state_key(JobState::Waiting), "queue:import:waiting");
        assert_eq!(index_key(), "queue:import:index");
    }
}
