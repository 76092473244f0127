use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    backend::StorageBackend,
    types::{JournalEntry, JournalEntryId, JournalOperation},
    JobsDbResult,
};

/// Write-ahead record of structural operations for one table prefix.
///
/// An entry is begun (durably) before the first statement of an operation
/// and committed only after the last one; committing deletes the entry.
/// Whatever is still pending on startup is replayed by the component owning
/// the operation.
#[derive(Clone)]
pub struct Journal {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
}

impl Journal {
    pub fn new(backend: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub async fn begin(&self, operation: JournalOperation) -> JobsDbResult<JournalEntryId> {
        let id = self.backend.journal_begin(&self.prefix, &operation).await?;
        debug!(prefix = %self.prefix, entry = %id, op = operation.name(), "journal entry begun");
        Ok(id)
    }

    pub async fn commit(&self, id: JournalEntryId) -> JobsDbResult<()> {
        self.backend.journal_commit(&self.prefix, id).await?;
        debug!(prefix = %self.prefix, entry = %id, "journal entry committed");
        Ok(())
    }

    /// Uncommitted entries in id order
    pub async fn list_pending(&self) -> JobsDbResult<Vec<JournalEntry>> {
        let pending = self.backend.journal_pending(&self.prefix).await?;
        if !pending.is_empty() {
            info!(prefix = %self.prefix, count = pending.len(), "found pending journal entries");
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn pending_until_committed() {
        let journal = Journal::new(Arc::new(MemoryBackend::new()), "gw");
        let first = journal
            .begin(JournalOperation::ArchiveDataset { index: "1".parse().unwrap() })
            .await
            .unwrap();
        let second = journal
            .begin(JournalOperation::CreateDataset {
                index: "3".parse().unwrap(),
                seal: Some("2".parse().unwrap()),
            })
            .await
            .unwrap();
        assert!(first < second);

        journal.commit(first).await.unwrap();
        let pending = journal.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);

        journal.commit(second).await.unwrap();
        assert!(journal.list_pending().await.unwrap().is_empty());
    }
}
