use std::time::Duration;

use thiserror::Error;

use crate::types::{DatasetIndex, JobId, JobState};

/// Result type for jobsdb operations
pub type JobsDbResult<T> = Result<T, JobsDbError>;

/// Errors surfaced by the job store and its structural components
#[derive(Error, Debug, Clone)]
pub enum JobsDbError {
    /// Transient storage fault. Nothing was written; the caller may retry with backoff.
    #[error("Write error: {0}")]
    Write(String),

    /// Logical misuse of the job lifecycle. Never retried.
    #[error("Invalid transition for job {job_id}: {from:?} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: Option<JobState>,
        to: JobState,
    },

    /// Setup, migration or journal replay has not completed yet.
    #[error("jobsdb is not ready")]
    NotReady,

    /// The structural lock could not be taken within the allotted time.
    #[error("Timed out after {waited:?} waiting for lock {scope}")]
    LockTimeout { scope: String, waited: Duration },

    /// The lease of a held lock was taken over mid-operation. The operation
    /// stopped; its journal entry stays pending for the next setup.
    #[error("Lock {scope} was lost")]
    LockLost { scope: String },

    /// The schema could not be brought to a known version. Fatal to setup.
    #[error("Migration failure: {0}")]
    MigrationFailure(String),

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(DatasetIndex),

    /// The dataset targeted by a write is no longer writable.
    #[error("Dataset {0} is sealed")]
    DatasetSealed(DatasetIndex),

    /// A structural operation does not apply to the dataset in its current state.
    #[error("Invalid dataset state: {0}")]
    InvalidState(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid dataset index: {0}")]
    InvalidIndex(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobsDbError {
    /// Create a write error
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    /// Create an archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Whether the caller should retry the same call after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Write(_)
                | Self::NotReady
                | Self::LockTimeout { .. }
                | Self::LockLost { .. }
                | Self::DeadlineExceeded(_)
        )
    }

    /// Whether the instance must refuse to serve until an operator intervenes
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MigrationFailure(_))
    }
}

impl From<serde_json::Error> for JobsDbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for JobsDbError {
    fn from(err: std::io::Error) -> Self {
        Self::Archive(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(JobsDbError::write("connection reset").is_retryable());
        assert!(JobsDbError::NotReady.is_retryable());
        assert!(JobsDbError::LockLost { scope: "gw_jobsdb".into() }.is_retryable());
        assert!(!JobsDbError::MigrationFailure("bad".into()).is_retryable());
        assert!(JobsDbError::MigrationFailure("bad".into()).is_fatal());

        let err = JobsDbError::InvalidTransition {
            job_id: JobId::new(3),
            from: Some(JobState::Succeeded),
            to: JobState::Succeeded,
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Invalid transition for job 3: Some(Succeeded) -> succeeded"
        );
    }
}
