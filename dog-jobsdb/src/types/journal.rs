use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ArchiveHandle, DatasetIndex, JournalEntryId};

/// A multi-step structural operation, recorded before its first statement runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOperation {
    /// Create `index` and seal the previous writable dataset, if any
    CreateDataset {
        index: DatasetIndex,
        seal: Option<DatasetIndex>,
    },
    /// Merge `sources` into the new dataset `target`
    CompactDatasets {
        sources: Vec<DatasetIndex>,
        target: DatasetIndex,
    },
    /// Export `index` to the archive sink
    ArchiveDataset { index: DatasetIndex },
    /// Drop the tables of `index` after `handle` was confirmed durable
    PruneDataset {
        index: DatasetIndex,
        handle: ArchiveHandle,
    },
}

impl JournalOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateDataset { .. } => "create_dataset",
            Self::CompactDatasets { .. } => "compact_datasets",
            Self::ArchiveDataset { .. } => "archive_dataset",
            Self::PruneDataset { .. } => "prune_dataset",
        }
    }
}

/// A pending row of the journal. Committing an entry deletes its row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub operation: JournalOperation,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operands_are_tagged_json() {
        let op = JournalOperation::CreateDataset {
            index: "3".parse().unwrap(),
            seal: Some("2".parse().unwrap()),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"op": "create_dataset", "index": "3", "seal": "2"}));
        let back: JournalOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }
}
