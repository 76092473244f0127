use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Job, JobState, StatusEvent};

/// Equality filter on a top-level job parameter, compared as text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterFilter {
    pub name: String,
    pub value: String,
}

/// Scope shared by claims and queries. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub states: Vec<JobState>,
    pub ordering_keys: Vec<String>,
    pub custom_vals: Vec<String>,
    pub workspace_id: Option<String>,
    pub parameters: Vec<ParameterFilter>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn ordering_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.ordering_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn custom_vals<S: Into<String>>(mut self, vals: impl IntoIterator<Item = S>) -> Self {
        self.custom_vals = vals.into_iter().map(Into::into).collect();
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(ParameterFilter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Whether the immutable attributes of `job` fall inside the filter
    pub fn matches_job(&self, job: &Job) -> bool {
        if !self.ordering_keys.is_empty() && !self.ordering_keys.contains(&job.ordering_key) {
            return false;
        }
        if !self.custom_vals.is_empty() && !self.custom_vals.contains(&job.custom_val) {
            return false;
        }
        if let Some(workspace_id) = &self.workspace_id {
            if &job.workspace_id != workspace_id {
                return false;
            }
        }
        self.parameters.iter().all(|filter| {
            job.parameter(&filter.name)
                .map(|value| parameter_text(value) == filter.value)
                .unwrap_or(false)
        })
    }

    /// Whether a job in `status` is in one of the requested states
    pub fn matches_state(&self, status: &StatusEvent) -> bool {
        self.states.is_empty() || self.states.contains(&status.state)
    }

    /// Claim eligibility: state match, and failed jobs only once their retry time passed
    pub fn claimable(&self, status: &StatusEvent, now: DateTime<Utc>) -> bool {
        if !self.matches_state(status) {
            return false;
        }
        match status.state {
            JobState::Waiting => true,
            JobState::Failed => status.retry_time <= now,
            _ => false,
        }
    }
}

/// Text form of a parameter value, as `->>` renders it in Postgres
pub fn parameter_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A consumer's request for a batch of jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub filter: JobFilter,
    pub limit: usize,
    pub worker: String,
    pub timeout: Option<Duration>,
}

impl ClaimRequest {
    /// Claim up to `limit` waiting or retryable failed jobs
    pub fn new(worker: impl Into<String>, limit: usize) -> Self {
        Self {
            filter: JobFilter::new().states([JobState::Waiting, JobState::Failed]),
            limit,
            worker: worker.into(),
            timeout: None,
        }
    }

    pub fn with_filter(mut self, filter: JobFilter) -> Self {
        if filter.states.is_empty() {
            self.filter = JobFilter {
                states: self.filter.states,
                ..filter
            };
        } else {
            self.filter = filter;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Read-only scan filter
pub type QueryFilter = JobFilter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, NewJob, NewStatus};
    use serde_json::json;

    fn job() -> Job {
        NewJob::new("user-1", b"{}".to_vec())
            .with_custom_val("GA")
            .with_workspace("ws-1")
            .with_parameters(json!({"source_id": "src-1", "stage": 2}))
            .into_job(JobId::new(1), Utc::now())
    }

    #[test]
    fn matches_immutable_attributes() {
        let job = job();
        assert!(JobFilter::new().matches_job(&job));
        assert!(JobFilter::new().custom_vals(["GA", "WEBHOOK"]).matches_job(&job));
        assert!(!JobFilter::new().custom_vals(["WEBHOOK"]).matches_job(&job));
        assert!(!JobFilter::new().ordering_keys(["user-2"]).matches_job(&job));
        assert!(!JobFilter::new().workspace("ws-2").matches_job(&job));
        assert!(JobFilter::new().parameter("source_id", "src-1").matches_job(&job));
        assert!(JobFilter::new().parameter("stage", "2").matches_job(&job));
        assert!(!JobFilter::new().parameter("missing", "x").matches_job(&job));
    }

    #[test]
    fn failed_jobs_wait_for_retry_time() {
        let now = Utc::now();
        let filter = ClaimRequest::new("w", 10).filter;
        let mut failed = NewStatus::waiting(JobId::new(1), now).into_event(2);
        failed.state = JobState::Failed;
        failed.retry_time = now + chrono::Duration::seconds(30);
        assert!(!filter.claimable(&failed, now));
        assert!(filter.claimable(&failed, now + chrono::Duration::seconds(31)));

        let executing = NewStatus::executing(JobId::new(1), 1, "w", now).into_event(3);
        assert!(!filter.claimable(&executing, now));
    }
}
