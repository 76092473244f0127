//! The ordered set of datasets of one table prefix.
//!
//! The catalog keeps a local snapshot of the dataset list, refreshed after
//! every structural operation and whenever it is older than the configured
//! refresh interval. The snapshot is advisory: writers re-validate against
//! storage and refresh when they find a dataset sealed or gone.
//!
//! Structural changes run under the prefix lock and are recorded in the
//! journal before their first statement, so a crash at any point is finished
//! by [`DatasetCatalog::replay`] on the next start. The lease is confirmed
//! before each step; a lost lock stops the operation and leaves its entry
//! pending.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::StorageBackend,
    config::JobsDbConfig,
    journal::Journal,
    lock::{LockGuard, LockManager},
    migrator::MigrationSet,
    observability::ObservabilityLayer,
    types::{Dataset, DatasetIndex, DatasetState, JobsDbEvent, JournalEntry, JournalOperation},
    JobsDbError, JobsDbResult,
};

/// Why a rotation is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Rotate only if the writable dataset is too large or too old
    Policy,
    /// Rotate unconditionally
    Explicit,
}

struct Snapshot {
    datasets: BTreeMap<DatasetIndex, Dataset>,
    loaded_at: Option<Instant>,
}

pub struct DatasetCatalog {
    backend: Arc<dyn StorageBackend>,
    config: Arc<JobsDbConfig>,
    locks: LockManager,
    journal: Journal,
    migrations: Arc<MigrationSet>,
    observability: ObservabilityLayer,
    snapshot: RwLock<Snapshot>,
}

impl DatasetCatalog {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: Arc<JobsDbConfig>,
        locks: LockManager,
        journal: Journal,
        migrations: Arc<MigrationSet>,
        observability: ObservabilityLayer,
    ) -> Self {
        Self {
            backend,
            config,
            locks,
            journal,
            migrations,
            observability,
            snapshot: RwLock::new(Snapshot {
                datasets: BTreeMap::new(),
                loaded_at: None,
            }),
        }
    }

    fn prefix(&self) -> &str {
        &self.config.table_prefix
    }

    /// Take the structural lock of this prefix
    pub async fn lock(&self) -> JobsDbResult<LockGuard> {
        let scope = self.config.lock_scope();
        self.locks
            .acquire(&scope, self.config.lock_timeout)
            .await
            .inspect_err(|e| {
                if matches!(e, JobsDbError::LockTimeout { .. }) {
                    self.observability.metrics().record_lock_timeout();
                }
            })
    }

    /// Reload the dataset list from storage
    pub async fn refresh(&self) -> JobsDbResult<()> {
        let datasets = self.backend.list_datasets(self.prefix()).await?;
        let mut snapshot = self.snapshot.write();
        snapshot.datasets = datasets
            .into_iter()
            .map(|dataset| (dataset.index.clone(), dataset))
            .collect();
        snapshot.loaded_at = Some(Instant::now());
        Ok(())
    }

    /// Refresh when the snapshot is older than the refresh interval
    pub async fn refresh_if_stale(&self) -> JobsDbResult<()> {
        let stale = self
            .snapshot
            .read()
            .loaded_at
            .map_or(true, |at| at.elapsed() >= self.config.refresh_interval);
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Every known dataset in index order, dropped ones included
    pub fn list(&self) -> Vec<Dataset> {
        self.snapshot.read().datasets.values().cloned().collect()
    }

    /// Datasets visible to claims and queries, in index order
    pub fn readable(&self) -> Vec<Dataset> {
        self.snapshot
            .read()
            .datasets
            .values()
            .filter(|dataset| dataset.state.is_readable())
            .cloned()
            .collect()
    }

    pub fn get(&self, index: &DatasetIndex) -> Option<Dataset> {
        self.snapshot.read().datasets.get(index).cloned()
    }

    /// The dataset receiving new jobs: the highest-index active one
    pub fn current_writable(&self) -> Option<Dataset> {
        self.snapshot
            .read()
            .datasets
            .values()
            .rev()
            .find(|dataset| dataset.is_writable())
            .cloned()
    }

    /// The readable dataset that holds `job_id` according to the snapshot.
    ///
    /// Id ranges increase with the index, so this is the last dataset whose
    /// first id is not above `job_id`.
    pub fn locate(&self, job_id: crate::types::JobId) -> Option<Dataset> {
        self.snapshot
            .read()
            .datasets
            .values()
            .filter(|dataset| dataset.state.is_readable())
            .filter(|dataset| dataset.min_job_id.is_some_and(|min| min <= job_id))
            .last()
            .cloned()
    }

    fn next_index(&self) -> DatasetIndex {
        self.snapshot
            .read()
            .datasets
            .keys()
            .next_back()
            .map(DatasetIndex::next)
            .unwrap_or_else(DatasetIndex::first)
    }

    fn rotation_due(&self, writable: &Dataset) -> bool {
        if writable.row_count >= self.config.max_ds_rows {
            return true;
        }
        writable
            .age(Utc::now())
            .to_std()
            .is_ok_and(|age| age >= self.config.max_ds_age)
    }

    /// Create a new writable dataset if the trigger asks for it.
    ///
    /// Returns the new index, or `None` when nothing was due or another
    /// caller rotated first.
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn rotate_if_needed(&self, trigger: RotationTrigger) -> JobsDbResult<Option<DatasetIndex>> {
        self.refresh().await?;
        let observed = self.current_writable();
        if trigger == RotationTrigger::Policy {
            match &observed {
                Some(writable) if !self.rotation_due(writable) => return Ok(None),
                _ => {}
            }
        }

        let guard = self.lock().await?;
        let result = self
            .rotate_locked(&guard, observed.map(|dataset| dataset.index), trigger)
            .await;
        release(guard).await;
        result
    }

    /// Rotation body; the caller holds the lock
    pub(crate) async fn rotate_locked(
        &self,
        guard: &LockGuard,
        observed: Option<DatasetIndex>,
        trigger: RotationTrigger,
    ) -> JobsDbResult<Option<DatasetIndex>> {
        self.refresh().await?;
        let current = self.current_writable();
        if current.as_ref().map(|dataset| &dataset.index) != observed.as_ref() {
            debug!(prefix = self.prefix(), "writable dataset changed meanwhile, skipping rotation");
            return Ok(None);
        }
        if trigger == RotationTrigger::Policy {
            if let Some(writable) = &current {
                if !self.rotation_due(writable) {
                    return Ok(None);
                }
            }
        }

        let index = self.next_index();
        let seal = current.map(|dataset| dataset.index);
        self.create_locked(guard, index.clone(), seal).await?;
        Ok(Some(index))
    }

    /// Make sure a writable dataset exists; the caller holds the lock
    pub(crate) async fn ensure_writable_locked(&self, guard: &LockGuard) -> JobsDbResult<DatasetIndex> {
        self.refresh().await?;
        if let Some(writable) = self.current_writable() {
            return Ok(writable.index);
        }
        let index = self.next_index();
        self.create_locked(guard, index.clone(), None).await?;
        Ok(index)
    }

    async fn create_locked(
        &self,
        guard: &LockGuard,
        index: DatasetIndex,
        seal: Option<DatasetIndex>,
    ) -> JobsDbResult<()> {
        guard.ensure_held().await?;
        let entry = self
            .journal
            .begin(JournalOperation::CreateDataset {
                index: index.clone(),
                seal: seal.clone(),
            })
            .await?;
        guard.ensure_held().await?;
        self.apply_create(&index, seal.as_ref()).await?;
        guard.ensure_held().await?;
        self.journal.commit(entry).await?;
        self.refresh().await?;
        info!(prefix = self.prefix(), dataset = %index, sealed = ?seal, "rotated to new dataset");
        Ok(())
    }

    /// Create the new dataset and seal the previous one in a single backend
    /// transaction, so a writable dataset exists at every instant. Either
    /// half already done is skipped, which lets replay re-drive a partial run.
    ///
    /// Inserts still running against the old dataset finish before the
    /// transaction commits, which keeps every id of the new dataset above
    /// every id committed to the old one.
    async fn apply_create(&self, index: &DatasetIndex, seal: Option<&DatasetIndex>) -> JobsDbResult<()> {
        let existing = self.backend.list_datasets(self.prefix()).await?;
        let state_of = |wanted: &DatasetIndex| {
            existing
                .iter()
                .find(|dataset| &dataset.index == wanted)
                .map(|dataset| dataset.state)
        };
        let sealing = seal.filter(|previous| state_of(previous) == Some(DatasetState::Active));

        let ddl = self.migrations.dataset_ddl(self.prefix(), index);
        let version = self.migrations.latest_version().unwrap_or(0);
        let created = self
            .backend
            .rotate_dataset(self.prefix(), index, version, &ddl, sealing)
            .await?;

        if let Some(previous) = sealing {
            self.observability.emit(JobsDbEvent::DatasetSealed {
                dataset: previous.clone(),
                at: Utc::now(),
            });
        }
        if created {
            self.observability.metrics().record_dataset_created();
            self.observability.emit(JobsDbEvent::DatasetCreated {
                dataset: index.clone(),
                at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Seal `index`. Sealing the writable dataset rotates to a new one.
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn seal(&self, index: &DatasetIndex) -> JobsDbResult<()> {
        let guard = self.lock().await?;
        let result = self.seal_locked(&guard, index).await;
        release(guard).await;
        result
    }

    async fn seal_locked(&self, guard: &LockGuard, index: &DatasetIndex) -> JobsDbResult<()> {
        self.refresh().await?;
        let dataset = self
            .get(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        match dataset.state {
            DatasetState::Active => {
                let is_writable = self
                    .current_writable()
                    .is_some_and(|writable| &writable.index == index);
                if is_writable {
                    self.create_locked(guard, self.next_index(), Some(index.clone())).await
                } else {
                    guard.ensure_held().await?;
                    self.backend
                        .set_dataset_state(self.prefix(), index, DatasetState::Sealed)
                        .await?;
                    self.refresh().await
                }
            }
            DatasetState::Sealed | DatasetState::Archived => Ok(()),
            state => Err(JobsDbError::InvalidState(format!(
                "cannot seal dataset {index} in state {state}"
            ))),
        }
    }

    /// Drop the tables of a sealed or archived dataset
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn drop_dataset(&self, index: &DatasetIndex) -> JobsDbResult<()> {
        let guard = self.lock().await?;
        let result = self.drop_locked(&guard, index).await;
        release(guard).await;
        result
    }

    async fn drop_locked(&self, guard: &LockGuard, index: &DatasetIndex) -> JobsDbResult<()> {
        self.refresh().await?;
        let dataset = self
            .get(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        match dataset.state {
            DatasetState::Sealed | DatasetState::Archived => {}
            DatasetState::Dropped => return Ok(()),
            state => {
                return Err(JobsDbError::InvalidState(format!(
                    "cannot drop dataset {index} in state {state}"
                )))
            }
        }
        guard.ensure_held().await?;
        self.backend.drop_dataset_tables(self.prefix(), index).await?;
        self.observability.metrics().record_dataset_dropped();
        self.observability.emit(JobsDbEvent::DatasetDropped {
            dataset: index.clone(),
            at: Utc::now(),
        });
        info!(prefix = self.prefix(), dataset = %index, "dropped dataset");
        self.refresh().await
    }

    /// Merge one run of small, fully processed, adjacent sealed datasets.
    ///
    /// Returns the index of the merged dataset, or `None` when no run of at
    /// least two datasets fits in `max_rows`.
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn compact(&self, max_rows: u64) -> JobsDbResult<Option<DatasetIndex>> {
        let guard = self.lock().await?;
        let result = self.compact_locked(&guard, max_rows).await;
        release(guard).await;
        result
    }

    async fn compact_locked(&self, guard: &LockGuard, max_rows: u64) -> JobsDbResult<Option<DatasetIndex>> {
        self.refresh().await?;
        let Some((sources, target)) = self.plan_compaction(max_rows).await? else {
            return Ok(None);
        };

        guard.ensure_held().await?;
        let entry = self
            .journal
            .begin(JournalOperation::CompactDatasets {
                sources: sources.clone(),
                target: target.clone(),
            })
            .await?;
        self.apply_compact(guard, &sources, &target).await?;
        guard.ensure_held().await?;
        self.journal.commit(entry).await?;
        self.refresh().await?;
        Ok(Some(target))
    }

    /// First run of adjacent compactable datasets and the index to merge them into
    async fn plan_compaction(&self, max_rows: u64) -> JobsDbResult<Option<(Vec<DatasetIndex>, DatasetIndex)>> {
        let all = self.list();
        let mut run: Vec<&Dataset> = Vec::new();
        let mut run_rows = 0;
        let mut best: Option<Vec<&Dataset>> = None;

        for dataset in all.iter().filter(|dataset| dataset.state != DatasetState::Dropped) {
            let fits = dataset.state == DatasetState::Sealed
                && run_rows + dataset.row_count <= max_rows
                && self.fully_processed(dataset).await?;
            if fits {
                run.push(dataset);
                run_rows += dataset.row_count;
                continue;
            }
            if run.len() >= 2 {
                best = Some(std::mem::take(&mut run));
                break;
            }
            run.clear();
            run_rows = 0;
            // The dataset that broke the run may start the next one
            if dataset.state == DatasetState::Sealed
                && dataset.row_count <= max_rows
                && self.fully_processed(dataset).await?
            {
                run.push(dataset);
                run_rows = dataset.row_count;
            }
        }
        if best.is_none() && run.len() >= 2 {
            best = Some(run);
        }
        let Some(best) = best else {
            return Ok(None);
        };

        let first = &best[0].index;
        let previous = all
            .iter()
            .map(|dataset| &dataset.index)
            .filter(|index| *index < first)
            .last();
        let Some(target) = DatasetIndex::between(previous, first) else {
            warn!(prefix = self.prefix(), dataset = %first, "no free index before dataset, skipping compaction");
            return Ok(None);
        };
        Ok(Some((best.iter().map(|dataset| dataset.index.clone()).collect(), target)))
    }

    async fn fully_processed(&self, dataset: &Dataset) -> JobsDbResult<bool> {
        let counts = self.backend.state_counts(self.prefix(), &dataset.index).await?;
        Ok(counts.non_terminal() == 0)
    }

    /// Create the target hidden, copy every source, then swap atomically.
    /// Idempotent: a target that is no longer migrating means the swap happened.
    async fn apply_compact(
        &self,
        guard: &LockGuard,
        sources: &[DatasetIndex],
        target: &DatasetIndex,
    ) -> JobsDbResult<()> {
        let existing = self.backend.list_datasets(self.prefix()).await?;
        let state_of = |wanted: &DatasetIndex| {
            existing
                .iter()
                .find(|dataset| &dataset.index == wanted)
                .map(|dataset| dataset.state)
        };

        match state_of(target) {
            Some(DatasetState::Migrating) => {}
            Some(_) => return Ok(()),
            None => {
                guard.ensure_held().await?;
                let ddl = self.migrations.dataset_ddl(self.prefix(), target);
                let version = self.migrations.latest_version().unwrap_or(0);
                self.backend
                    .create_dataset(self.prefix(), target, version, &ddl, DatasetState::Migrating)
                    .await?;
            }
        }

        let mut copied = 0;
        for source in sources {
            if state_of(source).is_some_and(|state| state.has_tables()) {
                guard.ensure_held().await?;
                copied += self.backend.copy_dataset(self.prefix(), source, target).await?;
            }
        }
        guard.ensure_held().await?;
        self.backend
            .replace_datasets(self.prefix(), sources, target)
            .await?;

        self.observability.metrics().record_compaction();
        self.observability.emit(JobsDbEvent::DatasetsCompacted {
            sources: sources.to_vec(),
            target: target.clone(),
            at: Utc::now(),
        });
        info!(
            prefix = self.prefix(),
            target = %target,
            sources = sources.len(),
            jobs = copied,
            "compacted datasets"
        );
        Ok(())
    }

    /// Finish a pending catalog operation. Returns `false` for entries owned elsewhere.
    pub(crate) async fn replay(&self, guard: &LockGuard, entry: &JournalEntry) -> JobsDbResult<bool> {
        match &entry.operation {
            JournalOperation::CreateDataset { index, seal } => {
                info!(prefix = self.prefix(), entry = %entry.id, dataset = %index, "replaying dataset creation");
                guard.ensure_held().await?;
                self.apply_create(index, seal.as_ref()).await?;
            }
            JournalOperation::CompactDatasets { sources, target } => {
                info!(prefix = self.prefix(), entry = %entry.id, target = %target, "replaying compaction");
                self.apply_compact(guard, sources, target).await?;
            }
            _ => return Ok(false),
        }
        guard.ensure_held().await?;
        self.journal.commit(entry.id).await?;
        self.refresh().await?;
        Ok(true)
    }

    /// How long the lock may wait before a structural call gives up
    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }
}

/// Release a guard, logging instead of failing the operation it protected
pub(crate) async fn release(guard: LockGuard) {
    let scope = guard.scope().to_string();
    if let Err(e) = guard.release().await {
        warn!(scope = %scope, error = %e, "failed to release lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::{LockOwner, NewJob};

    fn catalog(backend: &MemoryBackend, config: JobsDbConfig) -> DatasetCatalog {
        let shared: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        DatasetCatalog::new(
            shared.clone(),
            Arc::new(config.clone()),
            LockManager::new(shared.clone(), config.lock_lease),
            Journal::new(shared, config.table_prefix.clone()),
            Arc::new(MigrationSet::jobsdb()),
            ObservabilityLayer::new(),
        )
    }

    fn idx(s: &str) -> DatasetIndex {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn policy_rotation_by_rows() {
        let backend = MemoryBackend::new();
        let catalog = catalog(&backend, JobsDbConfig::new("gw").with_max_ds_rows(2));
        let guard = catalog.lock().await.unwrap();
        assert_eq!(catalog.ensure_writable_locked(&guard).await.unwrap(), idx("1"));
        guard.release().await.unwrap();

        assert_eq!(catalog.rotate_if_needed(RotationTrigger::Policy).await.unwrap(), None);
        backend
            .insert_jobs(
                "gw",
                &idx("1"),
                vec![NewJob::new("a", b"1".to_vec()), NewJob::new("a", b"2".to_vec())],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(
            catalog.rotate_if_needed(RotationTrigger::Policy).await.unwrap(),
            Some(idx("2"))
        );

        let states: Vec<_> = catalog.list().into_iter().map(|d| d.state).collect();
        assert_eq!(states, vec![DatasetState::Sealed, DatasetState::Active]);
        assert_eq!(catalog.current_writable().unwrap().index, idx("2"));
    }

    #[tokio::test]
    async fn sealing_writable_rotates() {
        let backend = MemoryBackend::new();
        let catalog = catalog(&backend, JobsDbConfig::new("gw"));
        catalog.rotate_if_needed(RotationTrigger::Explicit).await.unwrap();
        catalog.seal(&idx("1")).await.unwrap();
        assert_eq!(catalog.current_writable().unwrap().index, idx("2"));

        let err = catalog.drop_dataset(&idx("2")).await.unwrap_err();
        assert!(matches!(err, JobsDbError::InvalidState(_)));
        catalog.drop_dataset(&idx("1")).await.unwrap();
        assert_eq!(catalog.get(&idx("1")).unwrap().state, DatasetState::Dropped);
        assert!(catalog.readable().iter().all(|d| d.index != idx("1")));

        // Dropped indices are never reused
        catalog.rotate_if_needed(RotationTrigger::Explicit).await.unwrap();
        assert_eq!(catalog.current_writable().unwrap().index, idx("3"));
    }

    #[tokio::test]
    async fn lost_lock_stops_rotation() {
        let backend = MemoryBackend::new();
        let catalog = catalog(&backend, JobsDbConfig::new("gw"));
        catalog.rotate_if_needed(RotationTrigger::Explicit).await.unwrap();

        let guard = catalog.lock().await.unwrap();
        backend
            .take_over_lock("gw_jobsdb", &LockOwner::from("other"), Duration::from_secs(5))
            .unwrap();
        let err = catalog
            .rotate_locked(&guard, Some(idx("1")), RotationTrigger::Explicit)
            .await
            .unwrap_err();
        assert!(matches!(err, JobsDbError::LockLost { .. }));
        release(guard).await;

        assert!(backend.journal_pending("gw").await.unwrap().is_empty());
        let states: Vec<_> = backend
            .list_datasets("gw")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.state)
            .collect();
        assert_eq!(states, vec![DatasetState::Active]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rotation_never_leaves_prefix_without_writable() {
        let backend = MemoryBackend::new();
        let catalog = Arc::new(catalog(&backend, JobsDbConfig::new("gw")));
        catalog.rotate_if_needed(RotationTrigger::Explicit).await.unwrap();

        let rotating = tokio::spawn({
            let catalog = catalog.clone();
            async move {
                for _ in 0..20 {
                    catalog.rotate_if_needed(RotationTrigger::Explicit).await.unwrap();
                }
            }
        });
        while !rotating.is_finished() {
            let datasets = backend.list_datasets("gw").await.unwrap();
            assert!(datasets.iter().any(|d| d.state == DatasetState::Active));
            tokio::task::yield_now().await;
        }
        rotating.await.unwrap();
        assert_eq!(catalog.current_writable().unwrap().index, idx("21"));
    }
}
