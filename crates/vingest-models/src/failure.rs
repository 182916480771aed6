//! Failure taxonomy for import jobs.
//!
//! Every failure surfaced to the job store carries a kind; the kind,
//! not the message text, decides whether the job is retried.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Malformed share URL, unparseable platform id
    SourceInvalid,
    /// Access denied, not a video, private file, auth missing
    SourceDenied,
    /// 404, deleted share
    SourceNotFound,
    /// Upstream daily quota exhausted
    SourceQuota,
    /// Transient 5xx, reset during download
    SourceUnavailable,
    /// Every egress identity failed in one attempt
    EgressExhausted,
    /// Declared or observed bytes over the configured cap
    SizeExceeded,
    /// Non-2xx from the origin
    OriginApi,
    /// Connection reset or timeout talking to the origin
    OriginNetwork,
    /// Child-process download ceiling hit
    ChildTimeout,
    /// `kill_active` was invoked
    ManualKill,
    /// Explicit permanent marker from the worker
    Permanent,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried by the queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::SourceQuota
            | FailureKind::SourceUnavailable
            | FailureKind::EgressExhausted
            | FailureKind::OriginApi
            | FailureKind::OriginNetwork
            | FailureKind::ChildTimeout => true,
            FailureKind::SourceInvalid
            | FailureKind::SourceDenied
            | FailureKind::SourceNotFound
            | FailureKind::SizeExceeded
            | FailureKind::ManualKill
            | FailureKind::Permanent => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceInvalid => "source-invalid",
            FailureKind::SourceDenied => "source-denied",
            FailureKind::SourceNotFound => "source-not-found",
            FailureKind::SourceQuota => "source-quota",
            FailureKind::SourceUnavailable => "source-unavailable",
            FailureKind::EgressExhausted => "egress-exhausted",
            FailureKind::SizeExceeded => "size-exceeded",
            FailureKind::OriginApi => "origin-api-error",
            FailureKind::OriginNetwork => "origin-network-error",
            FailureKind::ChildTimeout => "child-timeout",
            FailureKind::ManualKill => "manual-kill",
            FailureKind::Permanent => "permanent-failure",
        }
    }

    /// Fallback classifier for free-form child-process stderr.
    ///
    /// Structured kinds are preferred everywhere else; this substring
    /// scan exists only because the downloader binary reports errors as
    /// prose.
    pub fn classify_stderr(stderr: &str) -> Option<FailureKind> {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("file not found") || lower.contains("video unavailable") {
            return Some(FailureKind::SourceNotFound);
        }
        if lower.contains("access denied") || lower.contains("unauthorized") {
            return Some(FailureKind::SourceDenied);
        }
        if lower.contains("file is not a video") {
            return Some(FailureKind::SourceDenied);
        }
        if lower.contains("invalid") && lower.contains("url") {
            return Some(FailureKind::SourceInvalid);
        }
        if lower.contains("quota") {
            return Some(FailureKind::SourceQuota);
        }
        None
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_table() {
        assert!(FailureKind::SourceQuota.is_retryable());
        assert!(FailureKind::SourceUnavailable.is_retryable());
        assert!(FailureKind::EgressExhausted.is_retryable());
        assert!(FailureKind::OriginApi.is_retryable());
        assert!(FailureKind::OriginNetwork.is_retryable());
        assert!(FailureKind::ChildTimeout.is_retryable());

        assert!(!FailureKind::SourceInvalid.is_retryable());
        assert!(!FailureKind::SourceDenied.is_retryable());
        assert!(!FailureKind::SourceNotFound.is_retryable());
        assert!(!FailureKind::SizeExceeded.is_retryable());
        assert!(!FailureKind::ManualKill.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
    }

    #[test]
    fn stderr_classification() {
        assert_eq!(
            FailureKind::classify_stderr("ERROR: File not found"),
            Some(FailureKind::SourceNotFound)
        );
        assert_eq!(
            FailureKind::classify_stderr("403: Access denied for this file"),
            Some(FailureKind::SourceDenied)
        );
        assert_eq!(
            FailureKind::classify_stderr("invalid share URL"),
            Some(FailureKind::SourceInvalid)
        );
        assert_eq!(
            FailureKind::classify_stderr("download quota exceeded for this file"),
            Some(FailureKind::SourceQuota)
        );
        assert_eq!(FailureKind::classify_stderr("network hiccup"), None);
    }
}
