use std::time::Duration;

use chrono::{DateTime, Utc};
use siphon_storage::StoreError;
use thiserror::Error;

/// Graph validation and scheduler runtime errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("duplicate task '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle through: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("invalid trigger for task '{task}': {reason}")]
    InvalidTrigger { task: String, reason: String },

    #[error("no action registered for task '{0}'")]
    MissingAction(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("run {0} not found")]
    RunNotFound(i64),

    #[error("task '{task}' already has an active run at {logical_ts}")]
    AlreadyActive { task: String, logical_ts: DateTime<Utc> },

    #[error("pipeline file error: {0}")]
    Pipeline(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownTask(_) | Self::RunNotFound(_) => 404,
            Self::AlreadyActive { .. } => 409,
            Self::Store(e) => e.status_code(),
            _ => 400,
        }
    }
}

/// Why a single attempt of a task action failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Network or timeout failure talking to the external source.
    #[error("source error: {0}")]
    Source(String),

    /// The broker did not acknowledge a publish.
    #[error("publish error: {0}")]
    Publish(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation was observed. Never retried.
    #[error("cancelled")]
    Cancelled,

    /// The source refused the request in a way another attempt cannot fix
    /// (4xx, malformed response, unknown collection).
    #[error("source rejected request: {0}")]
    Rejected(String),

    /// The window held more items than one run may fetch; the rest of the
    /// window was not ingested.
    #[error("window truncated at {limit} items ({published} published)")]
    Truncated { limit: usize, published: u64 },

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::Rejected(_) | Self::Truncated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let err = SchedulerError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle through: a -> b -> a");
    }

    #[test]
    fn status_codes() {
        assert_eq!(SchedulerError::UnknownTask("x".into()).status_code(), 404);
        assert_eq!(SchedulerError::DuplicateTask("x".into()).status_code(), 400);
        assert_eq!(
            SchedulerError::Store(StoreError::NotFound("run 1".into())).status_code(),
            404
        );
    }

    #[test]
    fn final_errors_are_not_retried() {
        assert!(!TaskError::Cancelled.is_retryable());
        assert!(TaskError::Source("503".into()).is_retryable());
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TaskError::Rejected("404".into()).is_retryable());
        assert!(!TaskError::Truncated { limit: 10, published: 10 }.is_retryable());
    }
}
