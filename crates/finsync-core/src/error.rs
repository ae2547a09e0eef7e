//! Error taxonomy shared by the queue, the worker pool and the handlers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::{ConnectionId, JobId};

/// Errors raised by the persistence ports.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The row was not in the expected `Running` state for this attempt.
    #[error("stale transition for {id} (attempt {attempt})")]
    StaleTransition { id: JobId, attempt: u32 },

    #[error("database error: {0}")]
    Database(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Busy / lock-contention failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Structured classification persisted in a job's `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Credential,
    Validation,
    Timeout,
    Cancelled,
    Interrupted,
    Internal,
}

/// Failure of a single job execution.
///
/// Handlers return this; the queue engine decides retry vs. discard from
/// [`JobError::is_transient`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error("provider error (transient): {0}")]
    TransientProvider(String),

    #[error("provider error: {0}")]
    PermanentProvider(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("handler exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("connection {0} is disabled")]
    ConnectionDisabled(ConnectionId),

    #[error("job was cancelled")]
    Cancelled,

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::TransientProvider(_) | JobError::Timeout(_) | JobError::Interrupted(_) => {
                true
            }
            JobError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            JobError::TransientProvider(_) => FailureClass::Transient,
            JobError::PermanentProvider(_) | JobError::ConnectionDisabled(_) => {
                FailureClass::Permanent
            }
            JobError::Credential(_) => FailureClass::Credential,
            JobError::Validation(_) => FailureClass::Validation,
            JobError::Timeout(_) => FailureClass::Timeout,
            JobError::Cancelled => FailureClass::Cancelled,
            JobError::Interrupted(_) => FailureClass::Interrupted,
            JobError::Internal(_) => FailureClass::Internal,
            JobError::Store(err) if err.is_transient() => FailureClass::Transient,
            JobError::Store(_) => FailureClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JobError::TransientProvider("429".into()), true)]
    #[case(JobError::Timeout(Duration::from_secs(1)), true)]
    #[case(JobError::Interrupted("shutdown".into()), true)]
    #[case(JobError::Store(StoreError::Unavailable("busy".into())), true)]
    #[case(JobError::PermanentProvider("401".into()), false)]
    #[case(JobError::Credential("bad key".into()), false)]
    #[case(JobError::Validation("missing field".into()), false)]
    #[case(JobError::Internal("bug".into()), false)]
    #[case(JobError::Cancelled, false)]
    #[case(JobError::Store(StoreError::Corrupt("bad row".into())), false)]
    fn transient_classification(#[case] err: JobError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn failure_class_follows_variant() {
        assert_eq!(
            JobError::Credential("x".into()).class(),
            FailureClass::Credential
        );
        assert_eq!(
            JobError::Timeout(Duration::from_secs(3)).class(),
            FailureClass::Timeout
        );
        assert_eq!(
            JobError::Store(StoreError::Unavailable("busy".into())).class(),
            FailureClass::Transient
        );
    }
}
