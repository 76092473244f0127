use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JobId;
use crate::error::JobsDbError;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Executing,
    Succeeded,
    Failed,
    Aborted,
    /// Terminal; the job was dropped on purpose (the reason goes in the error response)
    Filtered,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Executing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Aborted,
        JobState::Filtered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Filtered => "filtered",
        }
    }

    /// Terminal states are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted | Self::Filtered)
    }

    /// Whether a status update may move a job from `self` to `to`.
    ///
    /// Claiming (`Waiting`/`Failed` -> `Executing`) is not a status update and
    /// is handled by the claim path alone.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        matches!(
            (self, to),
            (
                Self::Executing,
                Self::Succeeded | Self::Failed | Self::Aborted | Self::Filtered | Self::Waiting
            )
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobsDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| JobsDbError::Serialization(format!("unknown job state: {s}")))
    }
}

/// One appended record in a job's status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Append sequence within the dataset; the highest one is the current status
    pub status_id: i64,
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub exec_time: DateTime<Utc>,
    /// Earliest time a failed job may be claimed again
    pub retry_time: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_response: Option<serde_json::Value>,
    pub worker: Option<String>,
    pub parameters: serde_json::Value,
}

/// A status transition reported by a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub state: JobState,
    pub exec_time: Option<DateTime<Utc>>,
    pub retry_time: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_response: Option<serde_json::Value>,
    pub worker: Option<String>,
    pub parameters: serde_json::Value,
}

impl StatusUpdate {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            exec_time: None,
            retry_time: None,
            error_code: None,
            error_response: None,
            worker: None,
            parameters: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn succeeded(job_id: JobId) -> Self {
        Self::new(job_id, JobState::Succeeded)
    }

    pub fn failed(job_id: JobId, error_code: impl Into<String>) -> Self {
        Self::new(job_id, JobState::Failed).with_error_code(error_code)
    }

    pub fn aborted(job_id: JobId, error_code: impl Into<String>) -> Self {
        Self::new(job_id, JobState::Aborted).with_error_code(error_code)
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_error_response(mut self, response: serde_json::Value) -> Self {
        self.error_response = Some(response);
        self
    }

    pub fn with_exec_time(mut self, at: DateTime<Utc>) -> Self {
        self.exec_time = Some(at);
        self
    }

    pub fn with_retry_time(mut self, at: DateTime<Utc>) -> Self {
        self.retry_time = Some(at);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A fully resolved status row ready to be appended by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub attempt: u32,
    pub exec_time: DateTime<Utc>,
    pub retry_time: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_response: Option<serde_json::Value>,
    pub worker: Option<String>,
    pub parameters: serde_json::Value,
}

impl NewStatus {
    /// Build the row for `update` given the attempt of the current status
    pub fn from_update(update: &StatusUpdate, attempt: u32, now: DateTime<Utc>) -> Self {
        let exec_time = update.exec_time.unwrap_or(now);
        Self {
            job_id: update.job_id,
            state: update.state,
            attempt,
            exec_time,
            retry_time: update.retry_time.unwrap_or(exec_time),
            error_code: update.error_code.clone(),
            error_response: update.error_response.clone(),
            worker: update.worker.clone(),
            parameters: update.parameters.clone(),
        }
    }

    /// The implicit first status of a freshly enqueued job
    pub fn waiting(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state: JobState::Waiting,
            attempt: 0,
            exec_time: now,
            retry_time: now,
            error_code: None,
            error_response: None,
            worker: None,
            parameters: serde_json::Value::Object(Default::default()),
        }
    }

    /// The status appended by a claim
    pub fn executing(job_id: JobId, attempt: u32, worker: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state: JobState::Executing,
            attempt,
            exec_time: now,
            retry_time: now,
            error_code: None,
            error_response: None,
            worker: Some(worker.to_string()),
            parameters: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn into_event(self, status_id: i64) -> StatusEvent {
        StatusEvent {
            status_id,
            job_id: self.job_id,
            state: self.state,
            attempt: self.attempt,
            exec_time: self.exec_time,
            retry_time: self.retry_time,
            error_code: self.error_code,
            error_response: self.error_response,
            worker: self.worker,
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_executing_jobs_move() {
        for to in JobState::ALL {
            assert!(!JobState::Waiting.can_transition_to(to));
            assert!(!JobState::Succeeded.can_transition_to(to));
            assert!(!JobState::Filtered.can_transition_to(to));
        }
        assert!(JobState::Executing.can_transition_to(JobState::Succeeded));
        assert!(JobState::Executing.can_transition_to(JobState::Waiting));
        assert!(!JobState::Executing.can_transition_to(JobState::Executing));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Filtered.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert_eq!("aborted".parse::<JobState>().unwrap(), JobState::Aborted);
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn retry_time_defaults_to_exec_time() {
        let at = Utc::now();
        let update = StatusUpdate::failed(JobId::new(1), "500").with_exec_time(at);
        let row = NewStatus::from_update(&update, 2, Utc::now());
        assert_eq!(row.retry_time, at);
        assert_eq!(row.attempt, 2);
        assert_eq!(row.error_code.as_deref(), Some("500"));
    }
}
