//! Origin error types.

use thiserror::Error;
use vingest_models::FailureKind;

pub type OriginResult<T> = Result<T, OriginError>;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("Failed to configure origin client: {0}")]
    ConfigError(String),

    #[error("Origin returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Origin network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OriginError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// Map to the shared failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            OriginError::Api { .. } => FailureKind::OriginApi,
            OriginError::Network(_) | OriginError::Io(_) => FailureKind::OriginNetwork,
            OriginError::ConfigError(_) => FailureKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for OriginError {
    fn from(e: reqwest::Error) -> Self {
        OriginError::Network(e.to_string())
    }
}
