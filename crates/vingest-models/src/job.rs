//! Import job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::progress::Progress;

/// Unique identifier for an import job.
///
/// The id is externally assigned (the submitter's request id) so that
/// re-submitting the same request lands on the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID (used when the submitter did not
    /// provide one).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the video comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Direct download URL
    #[default]
    Url,
    /// Cloud-drive share link
    Drive,
    /// Video-platform identifier or watch URL
    Platform,
    /// Pre-staged local file from the resumable uploader
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::Drive => "drive",
            SourceKind::Platform => "platform",
            SourceKind::Local => "local",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(SourceKind::Url),
            "drive" => Ok(SourceKind::Drive),
            "platform" => Ok(SourceKind::Platform),
            "local" => Ok(SourceKind::Local),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Immutable inputs of an import job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Externally assigned request id, used as the job id
    pub request_id: JobId,
    /// Source kind
    pub source_kind: SourceKind,
    /// URL, drive share link, platform id, or local path
    pub source_ref: String,
    /// Preferred output file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Pre-existing record in the external catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    /// API key forwarded to the catalog webhook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ImportSpec {
    /// Create a new spec with a fresh request id.
    pub fn new(source_kind: SourceKind, source_ref: impl Into<String>) -> Self {
        Self {
            request_id: JobId::new(),
            source_kind,
            source_ref: source_ref.into(),
            file_name: None,
            catalog_id: None,
            api_key: None,
        }
    }

    /// Set the preferred file name.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Set the catalog id.
    pub fn with_catalog_id(mut self, id: impl Into<String>) -> Self {
        self.catalog_id = Some(id.into());
        self
    }

    /// Set the catalog API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue
    #[default]
    Waiting,
    /// Job is being processed by a worker
    Active,
    /// Job failed retryably and is parked until its backoff expires
    Delayed,
    /// Job completed successfully
    Completed,
    /// Job failed terminally
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    /// Public CDN URL of the imported object
    pub cdn_url: String,
    /// Final file name on the origin
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// How many retries it took (0 = first attempt)
    pub attempts_made: u32,
    /// Egress attempts for platform downloads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_attempts: Vec<crate::progress::EgressAttempt>,
}

/// An import job as persisted by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    /// Immutable inputs
    pub spec: ImportSpec,

    /// Queue state
    #[serde(default)]
    pub status: JobState,

    /// Number of completed attempts (0 while the first attempt runs)
    #[serde(default)]
    pub attempts_made: u32,

    /// Maximum attempts before terminal failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Latest progress snapshot
    #[serde(default)]
    pub progress: Progress,

    /// Present only on `Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<ImportResult>,

    /// Present only on `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// When the job was submitted
    pub enqueued_at: DateTime<Utc>,

    /// When the current attempt started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    3
}

impl ImportJob {
    /// Create a freshly submitted job.
    pub fn new(spec: ImportSpec, max_attempts: u32) -> Self {
        Self {
            spec,
            status: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            progress: Progress::default(),
            return_value: None,
            failure_reason: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.spec.request_id
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `Active` when leased. Resets progress for the attempt.
    pub fn start(mut self) -> Self {
        self.status = JobState::Active;
        self.started_at = Some(Utc::now());
        self.progress = Progress::default();
        self
    }

    /// Mark job as completed.
    pub fn complete(mut self, result: ImportResult) -> Self {
        self.status = JobState::Completed;
        self.return_value = Some(result);
        self.failure_reason = None;
        self.finished_at = Some(Utc::now());
        self.progress.percentage = 100.0;
        self
    }

    /// Record a failed attempt. The job becomes `Delayed` when attempts
    /// remain and the failure was retryable, `Failed` otherwise.
    pub fn fail(mut self, reason: impl Into<String>, retryable: bool) -> Self {
        self.attempts_made += 1;
        let exhausted = self.attempts_made >= self.max_attempts;
        if retryable && !exhausted {
            self.status = JobState::Delayed;
            self.failure_reason = Some(reason.into());
        } else {
            self.status = JobState::Failed;
            self.failure_reason = Some(reason.into());
            self.return_value = None;
            self.finished_at = Some(Utc::now());
        }
        self
    }

    /// Re-arm a delayed or failed job for another attempt.
    pub fn rearm(mut self) -> Self {
        self.status = JobState::Waiting;
        self.failure_reason = None;
        self.finished_at = None;
        self.progress = Progress::default();
        self
    }

    /// Whether the attempt currently running is the last one allowed.
    pub fn on_final_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ImportSpec {
        ImportSpec::new(SourceKind::Url, "https://example.com/video.mp4")
            .with_file_name("video.mp4")
    }

    #[test]
    fn job_lifecycle_success() {
        let job = ImportJob::new(spec(), 3);
        assert_eq!(job.status, JobState::Waiting);

        let job = job.start();
        assert_eq!(job.status, JobState::Active);
        assert!(job.started_at.is_some());

        let job = job.complete(ImportResult {
            cdn_url: "https://cdn.example.com/video-abc123.mp4".into(),
            file_name: "video-abc123.mp4".into(),
            size: 42,
            attempts_made: 0,
            egress_attempts: Vec::new(),
        });
        assert_eq!(job.status, JobState::Completed);
        assert!(job.return_value.is_some());
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn retryable_failure_delays_until_exhausted() {
        let job = ImportJob::new(spec(), 2).start();
        let job = job.fail("connection reset", true);
        assert_eq!(job.status, JobState::Delayed);
        assert_eq!(job.attempts_made, 1);

        let job = job.rearm().start();
        let job = job.fail("connection reset", true);
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn permanent_failure_is_terminal_immediately() {
        let job = ImportJob::new(spec(), 3).start();
        let job = job.fail("access denied", false);
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn final_attempt_predicate() {
        let mut job = ImportJob::new(spec(), 3);
        assert!(!job.on_final_attempt());
        job.attempts_made = 2;
        assert!(job.on_final_attempt());
    }

    #[test]
    fn source_kind_parses() {
        assert_eq!("drive".parse::<SourceKind>().unwrap(), SourceKind::Drive);
        assert!("torrent".parse::<SourceKind>().is_err());
    }
}
