//! Error types for the reqflow orchestration layer
//!
//! Every component reports failures through a single [`ReqflowError`] so that
//! callers can match on the reason a request was refused or failed without
//! caring which component produced it.
//!
//! # Error Taxonomy
//!
//! ```text
//! ReqflowError
//! ├── AdmissionDenied   - rate limiter has no capacity and cannot queue
//! ├── QueueFull         - scheduler refused the enqueue
//! ├── Dropped           - scheduler evicted a queued item for higher priority work
//! ├── RetriesExhausted  - action kept failing after all retries
//! ├── Backend           - remote data/realtime service failure
//! ├── PoolExhausted     - connection pool full and nothing is evictable
//! ├── InvalidRequest    - malformed input (bad pattern, bad filter)
//! ├── Cancelled         - the reply channel went away
//! └── Internal          - bug or runtime failure (task panicked)
//! ```
//!
//! The enum is `Clone` because deduplicated fetches hand one failure to every
//! waiter.
//!
//! # Usage
//!
//! Library code returns [`Result`]:
//!
//! ```rust,ignore
//! use reqflow_core::{ReqflowError, Result};
//!
//! fn check(category: &str, admitted: bool) -> Result<()> {
//!     if !admitted {
//!         return Err(ReqflowError::admission_denied(category));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Application code should use `anyhow` with context.

use thiserror::Error;

/// Convenience result alias
pub type Result<T> = std::result::Result<T, ReqflowError>;

/// Errors surfaced by the orchestration components
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReqflowError {
    /// Admission limiter refused the request
    #[error("Rate limit exceeded for category '{category}'")]
    AdmissionDenied { category: String },

    /// Scheduler queue is at capacity
    #[error("Queue is full (max: {max})")]
    QueueFull { max: usize },

    /// Queued request was evicted before it ran
    #[error("Request dropped: {reason}")]
    Dropped { reason: String },

    /// Action failed on every attempt
    #[error("Request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Remote service returned an error or was unreachable
    #[error("Backend error: {0}")]
    Backend(String),

    /// No free channel slot
    #[error("Connection pool exhausted (max channels: {max})")]
    PoolExhausted { max: usize },

    /// Caller supplied something unusable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The waiting side or the worker went away
    #[error("Request cancelled")]
    Cancelled,

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReqflowError {
    /// Create an admission denied error
    pub fn admission_denied(category: impl Into<String>) -> Self {
        Self::AdmissionDenied {
            category: category.into(),
        }
    }

    /// Create a dropped error
    pub fn dropped(reason: impl Into<String>) -> Self {
        Self::Dropped {
            reason: reason.into(),
        }
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for ReqflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReqflowError::admission_denied("ai");
        assert_eq!(err.to_string(), "Rate limit exceeded for category 'ai'");

        let err = ReqflowError::QueueFull { max: 10 };
        assert_eq!(err.to_string(), "Queue is full (max: 10)");

        let err = ReqflowError::RetriesExhausted {
            attempts: 4,
            last_error: "Backend error: timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request failed after 4 attempts: Backend error: timeout"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(ReqflowError::backend("x"), ReqflowError::backend("x"));
        assert_ne!(ReqflowError::backend("x"), ReqflowError::internal("x"));
    }

    #[test]
    fn test_from_serde_error() {
        let err: ReqflowError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ReqflowError::InvalidRequest(_)));
    }
}
