use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{DatasetIndex, JobId, JobWithStatus};
use crate::error::JobsDbError;

/// Resume position of a scan: the last job handed out and the dataset it came from.
///
/// Scans resume strictly after `last_job_id`. Job ids grow with dataset
/// order, so the position stays valid when datasets are rotated, compacted
/// or dropped in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor {
    pub dataset: DatasetIndex,
    pub last_job_id: JobId,
}

impl QueryCursor {
    pub fn new(dataset: DatasetIndex, last_job_id: JobId) -> Self {
        Self {
            dataset,
            last_job_id,
        }
    }

    /// Opaque, URL-safe form handed to callers
    pub fn encode(&self) -> String {
        // Serializing two plain fields cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Cursor positioned right after `found`
    pub fn after(found: &JobWithStatus) -> Self {
        Self::new(found.dataset.clone(), found.job.job_id)
    }

    pub fn decode(token: &str) -> Result<Self, JobsDbError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| JobsDbError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| JobsDbError::InvalidCursor(e.to_string()))
    }
}

impl fmt::Display for QueryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for QueryCursor {
    type Err = JobsDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// One page of a paginated scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub jobs: Vec<JobWithStatus>,
    /// Position after the last returned job; `None` for an empty page
    pub next: Option<QueryCursor>,
    /// The page was filled up to its limit, so more jobs may follow right away
    pub has_more: bool,
}

impl QueryPage {
    /// Whether the scan caught up with the end of the store.
    /// Resuming from `next` later still returns jobs enqueued since.
    pub fn is_last(&self) -> bool {
        !self.has_more
    }
}
