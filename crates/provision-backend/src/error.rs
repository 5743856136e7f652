//! Error types for the provisioning boundary

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a backend failure.
///
/// Adapters classify errors when they cross the boundary so that callers
/// decide retryability on the kind, not on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// The endpoint of a freshly provisioned resource is not reachable yet
    /// (name resolution not propagated, connection refused).
    Connectivity,
    /// The operation did not complete within its timeout.
    Timeout,
    /// The warm pool had nothing to hand out and its policy is to fail.
    PoolExhausted,
    /// The referenced resource does not exist.
    NotFound,
    /// The backend refused the request (quota, credentials, bad input).
    Rejected,
    /// Anything else.
    Other,
}

impl BackendErrorKind {
    /// Classify a raw SDK error message.
    ///
    /// Only for adapters wrapping SDKs that surface nothing but text.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("name or service not known")
            || lower.contains("failed to connect")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("temporary failure in name resolution")
        {
            BackendErrorKind::Connectivity
        } else if lower.contains("timed out") || lower.contains("timeout") {
            BackendErrorKind::Timeout
        } else if lower.contains("pool exhausted") {
            BackendErrorKind::PoolExhausted
        } else if lower.contains("not found") {
            BackendErrorKind::NotFound
        } else {
            BackendErrorKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::Connectivity => "connectivity",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::PoolExhausted => "pool_exhausted",
            BackendErrorKind::NotFound => "not_found",
            BackendErrorKind::Rejected => "rejected",
            BackendErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the provisioning backend and the warm pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error during {operation}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    /// Backend operation that failed (`create`, `acquire`, `exec`, ...).
    pub operation: String,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, operation: &str, message: impl Into<String>) -> Self {
        BackendError {
            kind,
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Build an error from SDK text, classifying it by content.
    pub fn from_message(operation: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        BackendError {
            kind: BackendErrorKind::classify(&message),
            operation: operation.to_string(),
            message,
        }
    }

    pub fn connectivity(operation: &str, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Connectivity, operation, message)
    }

    pub fn pool_exhausted(image: &str) -> Self {
        Self::new(
            BackendErrorKind::PoolExhausted,
            "acquire",
            format!("no ready sandbox for image '{}'", image),
        )
    }

    /// Whether the failure is propagation lag worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Connectivity
    }
}

/// Errors returned by the archive store.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Archive does not exist in the bucket
    #[error("archive not found: {0}")]
    NotFound(String),

    /// Store is reachable but answered with an unexpected status
    #[error("archive store returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Transport failure talking to the store
    #[error("archive store request failed: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        ArchiveError::Http(err.to_string())
    }
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_dns_failure_as_connectivity() {
        let kind = BackendErrorKind::classify(
            "HTTPSConnectionPool: [Errno -2] Name or service not known",
        );
        assert_eq!(kind, BackendErrorKind::Connectivity);
        assert_eq!(
            BackendErrorKind::classify("Failed to connect to sandbox"),
            BackendErrorKind::Connectivity
        );
    }

    #[test]
    fn test_classify_other_messages() {
        assert_eq!(
            BackendErrorKind::classify("read timed out"),
            BackendErrorKind::Timeout
        );
        assert_eq!(
            BackendErrorKind::classify("app not found"),
            BackendErrorKind::NotFound
        );
        assert_eq!(
            BackendErrorKind::classify("quota exceeded"),
            BackendErrorKind::Other
        );
    }

    #[test]
    fn test_only_connectivity_is_transient() {
        assert!(BackendError::connectivity("exec", "dns").is_transient());
        assert!(!BackendError::pool_exhausted("python").is_transient());
        assert!(!BackendError::new(BackendErrorKind::Timeout, "exec", "slow").is_transient());
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::pool_exhausted("python");
        let msg = err.to_string();
        assert!(msg.contains("pool_exhausted"));
        assert!(msg.contains("acquire"));
        assert!(msg.contains("python"));
    }
}
