use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DatasetIndex, JobId, JobState};

/// Lifecycle events published on the jobsdb broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobsDbEvent {
    Enqueued {
        dataset: DatasetIndex,
        job_ids: Vec<JobId>,
        at: DateTime<Utc>,
    },

    Claimed {
        worker: String,
        job_ids: Vec<JobId>,
        at: DateTime<Utc>,
    },

    StatusUpdated {
        job_id: JobId,
        state: JobState,
        at: DateTime<Utc>,
    },

    DatasetCreated {
        dataset: DatasetIndex,
        at: DateTime<Utc>,
    },

    DatasetSealed {
        dataset: DatasetIndex,
        at: DateTime<Utc>,
    },

    DatasetArchived {
        dataset: DatasetIndex,
        location: String,
        at: DateTime<Utc>,
    },

    DatasetDropped {
        dataset: DatasetIndex,
        at: DateTime<Utc>,
    },

    DatasetsCompacted {
        sources: Vec<DatasetIndex>,
        target: DatasetIndex,
        at: DateTime<Utc>,
    },
}

impl JobsDbEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Claimed { .. } => "claimed",
            Self::StatusUpdated { .. } => "status_updated",
            Self::DatasetCreated { .. } => "dataset_created",
            Self::DatasetSealed { .. } => "dataset_sealed",
            Self::DatasetArchived { .. } => "dataset_archived",
            Self::DatasetDropped { .. } => "dataset_dropped",
            Self::DatasetsCompacted { .. } => "datasets_compacted",
        }
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Claimed { at, .. }
            | Self::StatusUpdated { at, .. }
            | Self::DatasetCreated { at, .. }
            | Self::DatasetSealed { at, .. }
            | Self::DatasetArchived { at, .. }
            | Self::DatasetDropped { at, .. }
            | Self::DatasetsCompacted { at, .. } => at,
        }
    }

    /// Whether the event describes a change to the dataset catalog
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::Enqueued { .. } | Self::Claimed { .. } | Self::StatusUpdated { .. }
        )
    }
}
