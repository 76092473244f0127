use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    backend::StorageBackend,
    types::{
        ArchiveHandle, ArchivedJob, Dataset, DatasetIndex, DatasetState, Job, JobFilter, JobId,
        JobState, JobWithStatus, JournalEntry, JournalEntryId, JournalOperation, LockOwner,
        NewJob, NewStatus, StateCounts, StatusEvent, StatusUpdate,
    },
    JobsDbError, JobsDbResult,
};

/// A migration as recorded by the memory backend
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub version: i64,
    pub statements: Vec<String>,
}

struct LockRow {
    owner: LockOwner,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct DatasetTables {
    jobs: BTreeMap<JobId, Job>,
    /// Status history per job, in append order
    history: BTreeMap<JobId, Vec<StatusEvent>>,
    next_status_id: i64,
}

impl DatasetTables {
    fn current(&self, job_id: JobId) -> Option<&StatusEvent> {
        self.history.get(&job_id).and_then(|events| events.last())
    }

    fn append(&mut self, status: NewStatus) -> StatusEvent {
        self.next_status_id += 1;
        let event = status.into_event(self.next_status_id);
        self.history
            .entry(event.job_id)
            .or_default()
            .push(event.clone());
        event
    }

    fn with_status(&self, index: &DatasetIndex, job: &Job) -> Option<JobWithStatus> {
        self.current(job.job_id).map(|status| JobWithStatus {
            dataset: index.clone(),
            job: job.clone(),
            status: status.clone(),
        })
    }
}

struct StoredDataset {
    meta: Dataset,
    tables: Option<DatasetTables>,
}

impl StoredDataset {
    fn tables(&self, index: &DatasetIndex) -> JobsDbResult<&DatasetTables> {
        match (&self.tables, self.meta.state) {
            (Some(tables), state) if state.has_tables() => Ok(tables),
            _ => Err(JobsDbError::DatasetNotFound(index.clone())),
        }
    }

    fn tables_mut(&mut self, index: &DatasetIndex) -> JobsDbResult<&mut DatasetTables> {
        match (&mut self.tables, self.meta.state) {
            (Some(tables), state) if state.has_tables() => Ok(tables),
            _ => Err(JobsDbError::DatasetNotFound(index.clone())),
        }
    }

    /// Catalog view with the row statistics filled in
    fn describe(&self) -> Dataset {
        let mut meta = self.meta.clone();
        if let Some(tables) = &self.tables {
            meta.row_count = tables.jobs.len() as u64;
            meta.min_job_id = tables.jobs.keys().next().copied();
            meta.max_job_id = tables.jobs.keys().next_back().copied();
        }
        meta
    }
}

#[derive(Default)]
struct PrefixStore {
    schema_version: Option<i64>,
    migrations: Vec<AppliedMigration>,
    job_seq: i64,
    journal_seq: i64,
    journal: BTreeMap<JournalEntryId, JournalEntry>,
    datasets: BTreeMap<DatasetIndex, StoredDataset>,
}

impl PrefixStore {
    fn dataset(&self, index: &DatasetIndex) -> JobsDbResult<&StoredDataset> {
        self.datasets
            .get(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))
    }

    fn dataset_mut(&mut self, index: &DatasetIndex) -> JobsDbResult<&mut StoredDataset> {
        self.datasets
            .get_mut(index)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))
    }
}

/// In-memory backend for tests and development.
///
/// Each call takes the store lock once, which makes every method a
/// transaction. Clones share the same storage, so two `JobsDb` instances
/// built on clones behave like two processes against one database.
#[derive(Clone)]
pub struct MemoryBackend {
    prefixes: Arc<RwLock<HashMap<String, PrefixStore>>>,
    locks: Arc<Mutex<HashMap<String, LockRow>>>,
    schema_writes: Arc<AtomicU64>,
    injected_faults: Arc<AtomicU32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            prefixes: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            schema_writes: Arc::new(AtomicU64::new(0)),
            injected_faults: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` job writes fail with a transient write error
    pub fn fail_next_writes(&self, count: u32) {
        self.injected_faults.store(count, Ordering::SeqCst);
    }

    /// Number of schema writes (migrations applied or versions forced) so far
    pub fn schema_writes(&self) -> u64 {
        self.schema_writes.load(Ordering::SeqCst)
    }

    /// Migrations applied to `prefix`, in order
    pub fn applied_migrations(&self, prefix: &str) -> Vec<AppliedMigration> {
        self.prefixes
            .read()
            .get(prefix)
            .map(|store| store.migrations.clone())
            .unwrap_or_default()
    }

    /// Current holder of a lock scope, if its lease has not expired
    pub fn lock_holder(&self, scope: &str) -> Option<LockOwner> {
        let now = Utc::now();
        self.locks
            .lock()
            .get(scope)
            .filter(|row| row.expires_at > now)
            .map(|row| row.owner.clone())
    }

    /// Hand `scope` to `owner` whatever its current lease, as a takeover
    /// after a missed renewal would
    pub fn take_over_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<()> {
        let expires_at = lease_until(lease)?;
        self.locks.lock().insert(
            scope.to_string(),
            LockRow {
                owner: owner.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    /// Journal entries still stored for `prefix`, committed ones included
    pub fn journal_len(&self, prefix: &str) -> usize {
        self.prefixes
            .read()
            .get(prefix)
            .map(|store| store.journal.len())
            .unwrap_or_default()
    }

    fn check_fault(&self, operation: &str) -> JobsDbResult<()> {
        let injected = self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if injected.is_ok() {
            return Err(JobsDbError::write(format!("injected fault in {operation}")));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_until(lease: Duration) -> JobsDbResult<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| JobsDbError::Config(format!("lock lease out of range: {e}")))?;
    Ok(Utc::now() + lease)
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn try_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool> {
        let expires_at = lease_until(lease)?;
        let now = Utc::now();
        let mut locks = self.locks.lock();
        if let Some(row) = locks.get(scope) {
            if row.owner != *owner && row.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            scope.to_string(),
            LockRow {
                owner: owner.clone(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn renew_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool> {
        let expires_at = lease_until(lease)?;
        let mut locks = self.locks.lock();
        match locks.get_mut(scope) {
            Some(row) if row.owner == *owner => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, scope: &str, owner: &LockOwner) -> JobsDbResult<()> {
        let mut locks = self.locks.lock();
        if locks.get(scope).is_some_and(|row| row.owner == *owner) {
            locks.remove(scope);
        }
        Ok(())
    }

    async fn schema_version(&self, prefix: &str) -> JobsDbResult<Option<i64>> {
        Ok(self
            .prefixes
            .read()
            .get(prefix)
            .and_then(|store| store.schema_version))
    }

    async fn apply_migration(&self, prefix: &str, version: i64, statements: &[String]) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        let store = prefixes.entry(prefix.to_string()).or_default();
        store.migrations.push(AppliedMigration {
            version,
            statements: statements.to_vec(),
        });
        store.schema_version = Some(version);
        for dataset in store.datasets.values_mut() {
            if dataset.meta.state.has_tables() {
                dataset.meta.schema_version = version;
            }
        }
        self.schema_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn force_schema_version(&self, prefix: &str, version: i64) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        prefixes.entry(prefix.to_string()).or_default().schema_version = Some(version);
        self.schema_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn journal_begin(&self, prefix: &str, operation: &JournalOperation) -> JobsDbResult<JournalEntryId> {
        let mut prefixes = self.prefixes.write();
        let store = prefixes.entry(prefix.to_string()).or_default();
        store.journal_seq += 1;
        let id = JournalEntryId(store.journal_seq);
        store.journal.insert(
            id,
            JournalEntry {
                id,
                operation: operation.clone(),
                started_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn journal_commit(&self, prefix: &str, id: JournalEntryId) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        prefixes
            .get_mut(prefix)
            .and_then(|store| store.journal.remove(&id))
            .ok_or_else(|| JobsDbError::Internal(format!("journal entry {id} not found")))?;
        Ok(())
    }

    async fn journal_pending(&self, prefix: &str) -> JobsDbResult<Vec<JournalEntry>> {
        Ok(self
            .prefixes
            .read()
            .get(prefix)
            .map(|store| store.journal.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_datasets(&self, prefix: &str) -> JobsDbResult<Vec<Dataset>> {
        Ok(self
            .prefixes
            .read()
            .get(prefix)
            .map(|store| store.datasets.values().map(StoredDataset::describe).collect())
            .unwrap_or_default())
    }

    async fn create_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        _ddl: &[String],
        state: DatasetState,
    ) -> JobsDbResult<bool> {
        self.check_fault("create_dataset")?;
        let mut prefixes = self.prefixes.write();
        let store = prefixes.entry(prefix.to_string()).or_default();
        if store.datasets.contains_key(index) {
            return Ok(false);
        }
        store.datasets.insert(
            index.clone(),
            StoredDataset {
                meta: Dataset::new(index.clone(), state, schema_version),
                tables: Some(DatasetTables::default()),
            },
        );
        Ok(true)
    }

    async fn rotate_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        _ddl: &[String],
        seal: Option<&DatasetIndex>,
    ) -> JobsDbResult<bool> {
        self.check_fault("rotate_dataset")?;
        let mut prefixes = self.prefixes.write();
        let store = prefixes.entry(prefix.to_string()).or_default();
        if let Some(previous) = seal {
            store.dataset(previous)?;
        }
        let created = !store.datasets.contains_key(index);
        if created {
            store.datasets.insert(
                index.clone(),
                StoredDataset {
                    meta: Dataset::new(index.clone(), DatasetState::Active, schema_version),
                    tables: Some(DatasetTables::default()),
                },
            );
        }
        if let Some(previous) = seal {
            let previous = store.dataset_mut(previous)?;
            if previous.meta.state == DatasetState::Active {
                previous.meta.state = DatasetState::Sealed;
                previous.meta.sealed_at.get_or_insert_with(Utc::now);
            }
        }
        Ok(created)
    }

    async fn set_dataset_state(&self, prefix: &str, index: &DatasetIndex, state: DatasetState) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        let dataset = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?
            .dataset_mut(index)?;
        dataset.meta.state = state;
        if state == DatasetState::Sealed && dataset.meta.sealed_at.is_none() {
            dataset.meta.sealed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_archive_handle(&self, prefix: &str, index: &DatasetIndex, handle: &ArchiveHandle) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        let dataset = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?
            .dataset_mut(index)?;
        dataset.meta.archive_handle = Some(handle.clone());
        dataset.meta.state = DatasetState::Archived;
        Ok(())
    }

    async fn drop_dataset_tables(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        let dataset = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?
            .dataset_mut(index)?;
        dataset.tables = None;
        dataset.meta.state = DatasetState::Dropped;
        Ok(())
    }

    async fn copy_dataset(&self, prefix: &str, source: &DatasetIndex, target: &DatasetIndex) -> JobsDbResult<u64> {
        self.check_fault("copy_dataset")?;
        let mut prefixes = self.prefixes.write();
        let store = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(source.clone()))?;

        let source_tables = store.dataset(source)?.tables(source)?;
        let to_copy: Vec<(Job, Vec<StatusEvent>)> = source_tables
            .jobs
            .values()
            .map(|job| {
                let history = source_tables.history.get(&job.job_id).cloned().unwrap_or_default();
                (job.clone(), history)
            })
            .collect();

        let target_tables = store.dataset_mut(target)?.tables_mut(target)?;
        let mut copied = 0;
        for (job, history) in to_copy {
            if target_tables.jobs.contains_key(&job.job_id) {
                continue;
            }
            for event in history {
                target_tables.append(NewStatus {
                    job_id: event.job_id,
                    state: event.state,
                    attempt: event.attempt,
                    exec_time: event.exec_time,
                    retry_time: event.retry_time,
                    error_code: event.error_code,
                    error_response: event.error_response,
                    worker: event.worker,
                    parameters: event.parameters,
                });
            }
            target_tables.jobs.insert(job.job_id, job);
            copied += 1;
        }
        Ok(copied)
    }

    async fn replace_datasets(&self, prefix: &str, sources: &[DatasetIndex], target: &DatasetIndex) -> JobsDbResult<()> {
        let mut prefixes = self.prefixes.write();
        let store = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(target.clone()))?;
        store.dataset(target)?;
        for source in sources {
            store.dataset(source)?;
        }

        let now = Utc::now();
        let target = store.dataset_mut(target)?;
        target.meta.state = DatasetState::Sealed;
        target.meta.sealed_at.get_or_insert(now);
        for source in sources {
            let dataset = store.dataset_mut(source)?;
            dataset.tables = None;
            dataset.meta.state = DatasetState::Dropped;
        }
        Ok(())
    }

    async fn drop_all(&self, prefix: &str) -> JobsDbResult<()> {
        self.prefixes.write().remove(prefix);
        Ok(())
    }

    async fn insert_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<Job>> {
        self.check_fault("insert_jobs")?;
        let mut prefixes = self.prefixes.write();
        let store = prefixes
            .get_mut(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        match store.dataset(index)?.meta.state {
            DatasetState::Active => {}
            _ => return Err(JobsDbError::DatasetSealed(index.clone())),
        }

        let first_id = store.job_seq + 1;
        store.job_seq += jobs.len() as i64;
        let tables = store.dataset_mut(index)?.tables_mut(index)?;

        let mut inserted = Vec::with_capacity(jobs.len());
        for (offset, new_job) in jobs.into_iter().enumerate() {
            let job = new_job.into_job(JobId(first_id + offset as i64), now);
            tables.append(NewStatus::waiting(job.job_id, now));
            tables.jobs.insert(job.job_id, job.clone());
            inserted.push(job);
        }
        Ok(inserted)
    }

    async fn claim_jobs(
        &self,
        prefix: &str,
        datasets: &[DatasetIndex],
        filter: &JobFilter,
        limit: usize,
        worker: &str,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        self.check_fault("claim_jobs")?;
        let mut prefixes = self.prefixes.write();
        let Some(store) = prefixes.get_mut(prefix) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for index in datasets {
            if claimed.len() >= limit {
                break;
            }
            let Some(dataset) = store.datasets.get_mut(index) else {
                continue;
            };
            if !dataset.meta.state.is_readable() {
                continue;
            }
            let Some(tables) = dataset.tables.as_mut() else {
                continue;
            };

            let candidates: Vec<(JobId, u32)> = tables
                .jobs
                .values()
                .filter(|job| filter.matches_job(job))
                .filter_map(|job| {
                    tables
                        .current(job.job_id)
                        .filter(|status| filter.claimable(status, now))
                        .map(|status| (job.job_id, status.attempt))
                })
                .take(limit - claimed.len())
                .collect();

            for (job_id, attempt) in candidates {
                let status = tables.append(NewStatus::executing(job_id, attempt + 1, worker, now));
                if let Some(job) = tables.jobs.get(&job_id) {
                    claimed.push(JobWithStatus {
                        dataset: index.clone(),
                        job: job.clone(),
                        status,
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn append_statuses(
        &self,
        prefix: &str,
        updates: &[(DatasetIndex, StatusUpdate)],
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<StatusEvent>> {
        self.check_fault("append_statuses")?;
        let mut prefixes = self.prefixes.write();
        let store = prefixes.entry(prefix.to_string()).or_default();

        // Validate the whole batch before touching anything
        let mut staged: HashMap<JobId, (JobState, u32)> = HashMap::new();
        let mut rows = Vec::with_capacity(updates.len());
        for (index, update) in updates {
            let tables = store.dataset(index)?.tables(index)?;
            let current = match staged.get(&update.job_id) {
                Some(current) => Some(*current),
                None => tables
                    .current(update.job_id)
                    .map(|status| (status.state, status.attempt)),
            };
            let Some((from, attempt)) = current else {
                return Err(JobsDbError::InvalidTransition {
                    job_id: update.job_id,
                    from: None,
                    to: update.state,
                });
            };
            if !from.can_transition_to(update.state) {
                return Err(JobsDbError::InvalidTransition {
                    job_id: update.job_id,
                    from: Some(from),
                    to: update.state,
                });
            }
            staged.insert(update.job_id, (update.state, attempt));
            rows.push((index, NewStatus::from_update(update, attempt, now)));
        }

        let mut appended = Vec::with_capacity(rows.len());
        for (index, row) in rows {
            let tables = store.dataset_mut(index)?.tables_mut(index)?;
            appended.push(tables.append(row));
        }
        Ok(appended)
    }

    async fn query_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        filter: &JobFilter,
        after: Option<JobId>,
        limit: usize,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        let prefixes = self.prefixes.read();
        let store = prefixes
            .get(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        let tables = store.dataset(index)?.tables(index)?;

        let lower = after.map(|id| JobId(id.0.saturating_add(1))).unwrap_or(JobId(i64::MIN));
        Ok(tables
            .jobs
            .range(lower..)
            .map(|(_, job)| job)
            .filter(|job| filter.matches_job(job))
            .filter_map(|job| tables.with_status(index, job))
            .filter(|found| filter.matches_state(&found.status))
            .take(limit)
            .collect())
    }

    async fn job_history(&self, prefix: &str, index: &DatasetIndex, job_id: JobId) -> JobsDbResult<Vec<StatusEvent>> {
        let prefixes = self.prefixes.read();
        let store = prefixes
            .get(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        let tables = store.dataset(index)?.tables(index)?;
        if !tables.jobs.contains_key(&job_id) {
            return Err(JobsDbError::JobNotFound(job_id));
        }
        Ok(tables.history.get(&job_id).cloned().unwrap_or_default())
    }

    async fn export_dataset(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<Vec<ArchivedJob>> {
        let prefixes = self.prefixes.read();
        let store = prefixes
            .get(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        let tables = store.dataset(index)?.tables(index)?;
        Ok(tables
            .jobs
            .values()
            .map(|job| ArchivedJob {
                job: job.clone(),
                history: tables.history.get(&job.job_id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn state_counts(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<StateCounts> {
        let prefixes = self.prefixes.read();
        let store = prefixes
            .get(prefix)
            .ok_or_else(|| JobsDbError::DatasetNotFound(index.clone()))?;
        let tables = store.dataset(index)?.tables(index)?;
        let mut counts = StateCounts::default();
        for events in tables.history.values() {
            if let Some(current) = events.last() {
                counts.add(current.state, 1);
            }
        }
        Ok(counts)
    }
}
