//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: String, reason: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound(id.into())
    }

    pub fn invalid_transition(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }
}
