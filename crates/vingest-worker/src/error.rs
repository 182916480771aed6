//! Worker error types.

use thiserror::Error;
use vingest_models::FailureKind;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] vingest_fetch::FetchError),

    #[error("Origin error: {0}")]
    Origin(#[from] vingest_origin::OriginError),

    #[error("Queue error: {0}")]
    Queue(#[from] vingest_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Classify into the shared failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            WorkerError::Fetch(e) => e.kind(),
            WorkerError::Origin(e) => e.kind(),
            // Queue/IO hiccups mid-pipeline are worth another attempt.
            WorkerError::Queue(_) | WorkerError::Io(_) => FailureKind::SourceUnavailable,
            WorkerError::JobFailed(msg) => {
                FailureKind::classify_stderr(msg).unwrap_or(FailureKind::Permanent)
            }
            WorkerError::ConfigError(_) => FailureKind::Permanent,
        }
    }

    /// Check if the failure may be retried by the queue.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether this failure came from `kill_active` or shutdown.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkerError::Fetch(vingest_fetch::FetchError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_keep_their_kind() {
        let err = WorkerError::from(vingest_fetch::FetchError::NotAVideo(
            "application/pdf".into(),
        ));
        assert_eq!(err.kind(), FailureKind::SourceDenied);
        assert!(!err.is_retryable());
    }

    #[test]
    fn origin_errors_keep_their_kind() {
        let err = WorkerError::from(vingest_origin::OriginError::api(500, "boom"));
        assert_eq!(err.kind(), FailureKind::OriginApi);
        assert!(err.is_retryable());
    }

    #[test]
    fn free_form_messages_fall_back_to_substrings() {
        assert_eq!(
            WorkerError::job_failed("upstream said: access denied").kind(),
            FailureKind::SourceDenied
        );
        assert_eq!(
            WorkerError::job_failed("something odd happened").kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn cancellation_detection() {
        assert!(WorkerError::from(vingest_fetch::FetchError::Cancelled).is_cancellation());
        assert!(!WorkerError::job_failed("x").is_cancellation());
    }
}
