//! Fetcher error types.

use thiserror::Error;
use vingest_models::FailureKind;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("File is not a video: {0}")]
    NotAVideo(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("All egress identities failed: {0}")]
    EgressExhausted(String),

    #[error("File too large: {declared} bytes exceeds limit of {max} bytes")]
    SizeExceeded { declared: u64, max: u64 },

    #[error("Downloader binary not found: {0}")]
    DownloaderMissing(String),

    #[error("Download timed out after {0} seconds")]
    ChildTimeout(u64),

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn invalid_source(msg: impl Into<String>) -> Self {
        Self::InvalidSource(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Map to the shared failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::InvalidSource(_) => FailureKind::SourceInvalid,
            FetchError::AccessDenied(_) | FetchError::NotAVideo(_) => FailureKind::SourceDenied,
            FetchError::NotFound(_) => FailureKind::SourceNotFound,
            FetchError::QuotaExceeded(_) => FailureKind::SourceQuota,
            FetchError::Unavailable(_) => FailureKind::SourceUnavailable,
            FetchError::EgressExhausted(_) => FailureKind::EgressExhausted,
            FetchError::SizeExceeded { .. } => FailureKind::SizeExceeded,
            FetchError::DownloaderMissing(_) => FailureKind::Permanent,
            FetchError::ChildTimeout(_) => FailureKind::ChildTimeout,
            FetchError::Cancelled => FailureKind::ManualKill,
            FetchError::Http(_) => FailureKind::SourceUnavailable,
            FetchError::Io(_) => FailureKind::SourceUnavailable,
        }
    }

    /// Whether the queue may retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            FetchError::invalid_source("bad url").kind(),
            FailureKind::SourceInvalid
        );
        assert_eq!(
            FetchError::NotAVideo("application/pdf".into()).kind(),
            FailureKind::SourceDenied
        );
        assert_eq!(
            FetchError::SizeExceeded {
                declared: 10,
                max: 5
            }
            .kind(),
            FailureKind::SizeExceeded
        );
        assert!(FetchError::ChildTimeout(1800).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
        assert!(FetchError::EgressExhausted("3 identities".into()).is_retryable());
    }
}
