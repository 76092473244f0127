//! Moves fully processed, sealed datasets to cold storage and prunes them.
//!
//! Archival exports a dataset's jobs with their whole status history to an
//! [`ArchiveSink`], records the returned handle and marks the dataset
//! archived; its tables stay readable. Pruning drops the tables once the sink
//! confirms the write is durable. Both steps run under the prefix lock and
//! are journaled; losing the lock between steps stops them with the entry
//! still pending.

pub mod sink;

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::{
    backend::StorageBackend,
    catalog::{release, DatasetCatalog},
    config::JobsDbConfig,
    journal::Journal,
    lock::LockGuard,
    observability::ObservabilityLayer,
    types::{ArchiveHandle, Dataset, DatasetIndex, DatasetState, JobsDbEvent, JournalEntry, JournalOperation},
    JobsDbError, JobsDbResult,
};

pub use sink::{ArchiveSink, FileArchiveSink, MemoryArchiveSink};

pub struct ArchiveManager {
    backend: Arc<dyn StorageBackend>,
    config: Arc<JobsDbConfig>,
    catalog: Arc<DatasetCatalog>,
    journal: Journal,
    sink: Arc<dyn ArchiveSink>,
    observability: ObservabilityLayer,
}

impl ArchiveManager {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: Arc<JobsDbConfig>,
        catalog: Arc<DatasetCatalog>,
        journal: Journal,
        sink: Arc<dyn ArchiveSink>,
        observability: ObservabilityLayer,
    ) -> Self {
        Self {
            backend,
            config,
            catalog,
            journal,
            sink,
            observability,
        }
    }

    fn prefix(&self) -> &str {
        &self.config.table_prefix
    }

    /// Sink key of a dataset
    pub fn key_for(&self, index: &DatasetIndex) -> String {
        format!("{}/{}", self.prefix(), index)
    }

    pub fn sink(&self) -> &Arc<dyn ArchiveSink> {
        &self.sink
    }

    /// Export a sealed, fully processed dataset. Archiving it again returns the recorded handle.
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn archive(&self, index: &DatasetIndex) -> JobsDbResult<ArchiveHandle> {
        let guard = self.catalog.lock().await?;
        let result = self.archive_locked(&guard, index).await;
        release(guard).await;
        result
    }

    async fn archive_locked(&self, guard: &LockGuard, index: &DatasetIndex) -> JobsDbResult<ArchiveHandle> {
        self.catalog.refresh().await?;
        let dataset = self
            .catalog
            .get(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        match (dataset.state, &dataset.archive_handle) {
            (DatasetState::Archived, Some(handle)) => return Ok(handle.clone()),
            (DatasetState::Sealed, _) => {}
            (state, _) => {
                return Err(JobsDbError::InvalidState(format!(
                    "cannot archive dataset {index} in state {state}"
                )))
            }
        }
        let counts = self.backend.state_counts(self.prefix(), index).await?;
        if counts.non_terminal() > 0 {
            return Err(JobsDbError::InvalidState(format!(
                "dataset {index} still has {} unfinished jobs",
                counts.non_terminal()
            )));
        }

        guard.ensure_held().await?;
        let entry = self
            .journal
            .begin(JournalOperation::ArchiveDataset { index: index.clone() })
            .await?;
        let handle = self.apply_archive(guard, index).await?;
        guard.ensure_held().await?;
        self.journal.commit(entry).await?;
        self.catalog.refresh().await?;
        Ok(handle)
    }

    async fn apply_archive(&self, guard: &LockGuard, index: &DatasetIndex) -> JobsDbResult<ArchiveHandle> {
        let jobs = self.backend.export_dataset(self.prefix(), index).await?;
        let handle = self.sink.write(&self.key_for(index), &jobs).await?;
        guard.ensure_held().await?;
        self.backend
            .set_archive_handle(self.prefix(), index, &handle)
            .await?;

        self.observability.metrics().record_dataset_archived();
        self.observability.emit(JobsDbEvent::DatasetArchived {
            dataset: index.clone(),
            location: handle.location.clone(),
            at: Utc::now(),
        });
        info!(
            prefix = self.prefix(),
            dataset = %index,
            location = %handle.location,
            jobs = handle.job_count,
            "archived dataset"
        );
        Ok(handle)
    }

    /// Drop an archived dataset once `handle` is confirmed durable
    #[instrument(skip(self, handle), fields(prefix = %self.config.table_prefix), err)]
    pub async fn prune(&self, index: &DatasetIndex, handle: &ArchiveHandle) -> JobsDbResult<()> {
        let guard = self.catalog.lock().await?;
        let result = self.prune_locked(&guard, index, handle).await;
        release(guard).await;
        result
    }

    async fn prune_locked(
        &self,
        guard: &LockGuard,
        index: &DatasetIndex,
        handle: &ArchiveHandle,
    ) -> JobsDbResult<()> {
        self.catalog.refresh().await?;
        let dataset = self
            .catalog
            .get(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        match dataset.state {
            DatasetState::Archived => {}
            DatasetState::Dropped => return Ok(()),
            state => {
                return Err(JobsDbError::InvalidState(format!(
                    "cannot prune dataset {index} in state {state}"
                )))
            }
        }
        if !self.sink.confirm(handle).await? {
            return Err(JobsDbError::archive(format!(
                "archive of dataset {index} at {} is not confirmed",
                handle.location
            )));
        }

        guard.ensure_held().await?;
        let entry = self
            .journal
            .begin(JournalOperation::PruneDataset {
                index: index.clone(),
                handle: handle.clone(),
            })
            .await?;
        guard.ensure_held().await?;
        self.apply_prune(index).await?;
        guard.ensure_held().await?;
        self.journal.commit(entry).await?;
        self.catalog.refresh().await
    }

    async fn apply_prune(&self, index: &DatasetIndex) -> JobsDbResult<()> {
        self.backend.drop_dataset_tables(self.prefix(), index).await?;
        self.observability.metrics().record_dataset_dropped();
        self.observability.emit(JobsDbEvent::DatasetDropped {
            dataset: index.clone(),
            at: Utc::now(),
        });
        info!(prefix = self.prefix(), dataset = %index, "pruned archived dataset");
        Ok(())
    }

    /// Datasets past retention whose jobs are all finished: sealed ones, and
    /// archived ones whose prune did not go through yet
    pub async fn eligible(&self) -> JobsDbResult<Vec<Dataset>> {
        self.catalog.refresh().await?;
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.archive_retention)
            .map_err(|e| JobsDbError::Config(format!("archive_retention out of range: {e}")))?;

        let mut eligible = Vec::new();
        for dataset in self.catalog.list() {
            let expired = matches!(dataset.state, DatasetState::Sealed | DatasetState::Archived)
                && dataset.sealed_at.is_some_and(|sealed_at| sealed_at + retention <= now);
            if !expired {
                continue;
            }
            let counts = self.backend.state_counts(self.prefix(), &dataset.index).await?;
            if counts.non_terminal() == 0 {
                eligible.push(dataset);
            }
        }
        Ok(eligible)
    }

    /// Archive and prune every eligible dataset under one lock. Returns the pruned indices.
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn archive_eligible(&self) -> JobsDbResult<Vec<DatasetIndex>> {
        let candidates = self.eligible().await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.catalog.lock().await?;
        let mut pruned = Vec::new();
        let mut outcome = Ok(());
        for dataset in candidates {
            let step = async {
                let handle = self.archive_locked(&guard, &dataset.index).await?;
                self.prune_locked(&guard, &dataset.index, &handle).await
            };
            match step.await {
                Ok(()) => pruned.push(dataset.index),
                Err(JobsDbError::InvalidState(reason)) => {
                    // Changed since the eligibility check; next cycle decides again
                    warn!(prefix = self.prefix(), dataset = %dataset.index, %reason, "skipping archival");
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        release(guard).await;
        outcome.map(|()| pruned)
    }

    /// Finish a pending archive operation. Returns `false` for entries owned elsewhere.
    pub(crate) async fn replay(&self, guard: &LockGuard, entry: &JournalEntry) -> JobsDbResult<bool> {
        match &entry.operation {
            JournalOperation::ArchiveDataset { index } => {
                info!(prefix = self.prefix(), entry = %entry.id, dataset = %index, "replaying archival");
                self.catalog.refresh().await?;
                if self
                    .catalog
                    .get(index)
                    .is_some_and(|dataset| dataset.state == DatasetState::Sealed)
                {
                    self.apply_archive(guard, index).await?;
                }
            }
            JournalOperation::PruneDataset { index, handle } => {
                info!(prefix = self.prefix(), entry = %entry.id, dataset = %index, "replaying prune");
                if self.sink.confirm(handle).await? {
                    guard.ensure_held().await?;
                    self.apply_prune(index).await?;
                } else {
                    warn!(
                        prefix = self.prefix(),
                        dataset = %index,
                        location = %handle.location,
                        "archive not confirmed, keeping dataset tables"
                    );
                }
            }
            _ => return Ok(false),
        }
        guard.ensure_held().await?;
        self.journal.commit(entry.id).await?;
        self.catalog.refresh().await?;
        Ok(true)
    }
}
