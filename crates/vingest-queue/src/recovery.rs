//! Recovery mirror store.
//!
//! Every leased job writes a mirror record here so a crashed process
//! leaves enough state behind for the next start to clean up temp files
//! and re-queue the work. Records expire one hour after their last
//! heartbeat.

use redis::AsyncCommands;
use tracing::{debug, warn};

use vingest_models::{JobId, Progress, RecoveryRecord, RecoveryStatus};

use crate::error::QueueResult;

const KEY_PREFIX: &str = "recovery:";

/// TTL of a live mirror record.
const RECORD_TTL_SECS: u64 = 3600;

/// Failed records are kept briefly for diagnostics.
const FAILED_RECORD_TTL_SECS: u64 = 600;

/// Store for per-active-job recovery records.
#[derive(Clone)]
pub struct RecoveryStore {
    client: redis::Client,
}

fn record_key(id: &JobId) -> String {
    format!("{KEY_PREFIX}{id}")
}

impl RecoveryStore {
    /// Create a new recovery store.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn put(&self, record: &RecoveryRecord, ttl_secs: u64) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(record_key(&record.job_id), json, ttl_secs)
            .await?;
        Ok(())
    }

    /// Open a record for a freshly leased job. Temp files tracked by a
    /// previous attempt carry over so they are never orphaned.
    pub async fn open(&self, mut record: RecoveryRecord) -> QueueResult<()> {
        if let Some(existing) = self.get(&record.job_id).await? {
            for path in existing.temp_files {
                if !record.temp_files.contains(&path) {
                    record.temp_files.push(path);
                }
            }
        }
        debug!(job_id = %record.job_id, "Opening recovery record");
        self.put(&record, RECORD_TTL_SECS).await
    }

    /// Read a record. Corrupt records are removed and reported as
    /// absent.
    pub async fn get(&self, id: &JobId) -> QueueResult<Option<RecoveryRecord>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(record_key(id)).await?;
        let Some(json) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Removing corrupt recovery record");
                conn.del::<_, ()>(record_key(id)).await?;
                Ok(None)
            }
        }
    }

    /// Refresh the heartbeat timestamp and TTL.
    pub async fn heartbeat(&self, id: &JobId) -> QueueResult<()> {
        if let Some(mut record) = self.get(id).await? {
            record.heartbeat();
            self.put(&record, RECORD_TTL_SECS).await?;
        }
        Ok(())
    }

    /// Write a progress snapshot through to the mirror.
    pub async fn update_progress(&self, id: &JobId, progress: Progress) -> QueueResult<()> {
        if let Some(mut record) = self.get(id).await? {
            record.progress = progress;
            record.heartbeat();
            self.put(&record, RECORD_TTL_SECS).await?;
        }
        Ok(())
    }

    /// Register a temp file owned by the job. Must be called before the
    /// first byte is written to the file.
    pub async fn track_temp_file(&self, id: &JobId, path: &str) -> QueueResult<()> {
        if let Some(mut record) = self.get(id).await? {
            record.track_temp_file(path);
            self.put(&record, RECORD_TTL_SECS).await?;
        }
        Ok(())
    }

    /// Update the mirrored status. Failed records stay around briefly
    /// for diagnostics; stalled records keep the full TTL so the next
    /// startup finds them.
    pub async fn set_status(&self, id: &JobId, status: RecoveryStatus) -> QueueResult<()> {
        if let Some(mut record) = self.get(id).await? {
            record.status = status;
            record.heartbeat();
            let ttl = match status {
                RecoveryStatus::Failed => FAILED_RECORD_TTL_SECS,
                _ => RECORD_TTL_SECS,
            };
            self.put(&record, ttl).await?;
        }
        Ok(())
    }

    /// Remove a record (normal completion path).
    pub async fn remove(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(record_key(id)).await?;
        Ok(())
    }

    /// List all mirror records, dropping corrupt entries along the way.
    pub async fn list_all(&self) -> QueueResult<Vec<RecoveryRecord>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{KEY_PREFIX}*");
        let mut records = Vec::new();
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
                let raw: Option<String> = conn.get(&key).await?;
                let Some(json) = raw else { continue };
                match serde_json::from_str::<RecoveryRecord>(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Removing corrupt recovery record");
                        conn.del::<_, ()>(&key).await?;
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(records)
    }
}
