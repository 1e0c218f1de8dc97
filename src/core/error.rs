//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::model::{ChangeSetId, ChangeSetStatus};

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store failure that is not expected to clear on retry.
    #[error("store error: {0}")]
    Store(String),
    /// Store failure that may succeed if retried (timeouts, dropped connections).
    #[error("transient store error: {0}")]
    Transient(String),
    /// A status change outside the allowed lifecycle was requested.
    #[error("invalid transition for change set {id}: {from} -> {to}")]
    InvalidTransition {
        /// Change set the transition was attempted on.
        id: ChangeSetId,
        /// Current status.
        from: ChangeSetStatus,
        /// Requested status.
        to: ChangeSetStatus,
    },
    /// The referenced change set does not exist.
    #[error("change set not found: {0}")]
    NotFound(ChangeSetId),
    /// Execution delegate failure.
    #[error("delegate error: {0}")]
    Delegate(String),
    /// A producer request was malformed.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    /// Configuration is missing or invalid.
    #[error("config error: {0}")]
    Config(String),
    /// Persisted documents could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SchedulerError {
    /// Whether a caller-level retry is worthwhile.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
