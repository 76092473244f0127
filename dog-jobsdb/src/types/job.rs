use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DatasetIndex, JobId, JobState, StatusEvent};

/// A job as handed in by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Producer-supplied message id
    pub uuid: Uuid,
    /// Key consumers keep in order (user or source id)
    pub ordering_key: String,
    /// Routing key consumers scope their claims by (destination type)
    pub custom_val: String,
    pub workspace_id: String,
    pub event_count: u32,
    pub payload: Vec<u8>,
    pub parameters: serde_json::Value,
    pub expire_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(ordering_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            ordering_key: ordering_key.into(),
            custom_val: String::new(),
            workspace_id: String::new(),
            event_count: 1,
            payload: payload.into(),
            parameters: serde_json::Value::Object(Default::default()),
            expire_at: None,
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_custom_val(mut self, custom_val: impl Into<String>) -> Self {
        self.custom_val = custom_val.into();
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_event_count(mut self, event_count: u32) -> Self {
        self.event_count = event_count;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_expire_at(mut self, expire_at: DateTime<Utc>) -> Self {
        self.expire_at = Some(expire_at);
        self
    }

    /// Attach the id and creation time assigned by storage
    pub fn into_job(self, job_id: JobId, created_at: DateTime<Utc>) -> Job {
        Job {
            job_id,
            uuid: self.uuid,
            ordering_key: self.ordering_key,
            custom_val: self.custom_val,
            workspace_id: self.workspace_id,
            event_count: self.event_count,
            payload: self.payload,
            parameters: self.parameters,
            created_at,
            expire_at: self.expire_at,
        }
    }
}

/// A stored job. Never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub uuid: Uuid,
    pub ordering_key: String,
    pub custom_val: String,
    pub workspace_id: String,
    pub event_count: u32,
    pub payload: Vec<u8>,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Value of a top-level parameter, if the parameters are an object
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.as_object().and_then(|params| params.get(key))
    }
}

/// A job together with its current status and the dataset holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobWithStatus {
    pub dataset: DatasetIndex,
    pub job: Job,
    pub status: StatusEvent,
}

impl JobWithStatus {
    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn attempt(&self) -> u32 {
        self.status.attempt
    }
}

/// One job with its full status history, as written to an archive sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub job: Job,
    pub history: Vec<StatusEvent>,
}

/// Current-state counts, per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub executing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
    pub filtered: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Executing => self.executing += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::Failed => self.failed += count,
            JobState::Aborted => self.aborted += count,
            JobState::Filtered => self.filtered += count,
        }
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Executing => self.executing,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Aborted => self.aborted,
            JobState::Filtered => self.filtered,
        }
    }

    pub fn merge(&mut self, other: &StateCounts) {
        for state in JobState::ALL {
            self.add(state, other.get(state));
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }

    /// Jobs that may still change state
    pub fn non_terminal(&self) -> u64 {
        self.waiting + self.executing + self.failed
    }
}

/// Per-dataset and overall current-state counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsDbStats {
    pub datasets: Vec<(DatasetIndex, StateCounts)>,
    pub totals: StateCounts,
}
