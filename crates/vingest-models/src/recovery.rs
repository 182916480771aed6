//! Recovery mirror records.
//!
//! Each active job keeps an out-of-band mirror of its state so that a
//! crashed process can be cleaned up on the next start. Records carry
//! the temp files the job owns; whoever finds a dead record inherits
//! the duty to remove them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ImportSpec, JobId};
use crate::progress::Progress;

/// Status mirrored for an in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    #[default]
    Active,
    /// Marked on graceful shutdown so startup picks the job up
    Stalled,
    Completed,
    Failed,
}

/// Per-active-job mirror of status, progress and owned temp files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub job_id: JobId,
    pub status: RecoveryStatus,
    /// The job's immutable inputs, kept so a sweep can describe the job
    /// without the queue
    pub spec: ImportSpec,
    pub progress: Progress,
    /// Absolute paths of temp files this job owns
    #[serde(default)]
    pub temp_files: Vec<String>,
    /// Refreshed by every heartbeat
    pub timestamp: DateTime<Utc>,
}

impl RecoveryRecord {
    /// Open a record for a freshly leased job.
    pub fn open(job_id: JobId, spec: ImportSpec) -> Self {
        Self {
            job_id,
            status: RecoveryStatus::Active,
            spec,
            progress: Progress::default(),
            temp_files: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Refresh the heartbeat timestamp.
    pub fn heartbeat(&mut self) {
        self.timestamp = Utc::now();
    }

    /// Register a temp file the job now owns. Must happen before any
    /// byte is written to the file.
    pub fn track_temp_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path);
        }
        self.timestamp = Utc::now();
    }

    /// Whether the record's heartbeat is older than the threshold.
    pub fn is_stale(&self, stale_threshold_secs: i64) -> bool {
        (Utc::now() - self.timestamp).num_seconds() > stale_threshold_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SourceKind;

    #[test]
    fn tracks_temp_files_once() {
        let spec = ImportSpec::new(SourceKind::Local, "/tmp/staging/upload-1.mp4");
        let mut record = RecoveryRecord::open(spec.request_id.clone(), spec);

        record.track_temp_file("/tmp/vingest/abc-video.mp4");
        record.track_temp_file("/tmp/vingest/abc-video.mp4");
        assert_eq!(record.temp_files.len(), 1);
    }

    #[test]
    fn staleness_follows_heartbeat() {
        let spec = ImportSpec::new(SourceKind::Url, "https://example.com/v.mp4");
        let mut record = RecoveryRecord::open(spec.request_id.clone(), spec);
        assert!(!record.is_stale(300));

        record.timestamp = Utc::now() - chrono::Duration::seconds(600);
        assert!(record.is_stale(300));

        record.heartbeat();
        assert!(!record.is_stale(300));
    }
}
