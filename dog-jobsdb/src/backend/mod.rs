pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{
    types::{
        ArchiveHandle, ArchivedJob, Dataset, DatasetIndex, DatasetState, Job, JobFilter, JobId,
        JobWithStatus, JournalEntry, JournalEntryId, JournalOperation, LockOwner, NewJob,
        StateCounts, StatusEvent, StatusUpdate,
    },
    JobsDbResult,
};

pub use memory::MemoryBackend;

/// Relational-store primitives the jobsdb components are written against.
///
/// Every method is scoped by a table prefix, so one backend may host several
/// independent jobsdb instances (`gw`, `rt`, `batch_rt`). Methods that write
/// are atomic: they either apply completely or return an error having changed
/// nothing. Datasets named by a caller but absent (or dropped) in storage are
/// reported with [`JobsDbError::DatasetNotFound`](crate::JobsDbError) by the
/// single-dataset methods and skipped by the multi-dataset ones.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    // ---- locking ----

    /// Take `scope` for `owner` if free (or its lease expired). Re-entrant for the same owner.
    async fn try_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool>;

    /// Extend a held lock. `false` means the lock was lost.
    async fn renew_lock(&self, scope: &str, owner: &LockOwner, lease: Duration) -> JobsDbResult<bool>;

    /// Release `scope` if `owner` holds it
    async fn unlock(&self, scope: &str, owner: &LockOwner) -> JobsDbResult<()>;

    // ---- schema ----

    /// Last applied migration version, `None` on a fresh prefix
    async fn schema_version(&self, prefix: &str) -> JobsDbResult<Option<i64>>;

    /// Run `statements`, record `version` and advance the schema version of
    /// every non-dropped dataset, in one transaction
    async fn apply_migration(&self, prefix: &str, version: i64, statements: &[String]) -> JobsDbResult<()>;

    /// Overwrite the recorded version without running anything
    async fn force_schema_version(&self, prefix: &str, version: i64) -> JobsDbResult<()>;

    // ---- journal ----

    async fn journal_begin(&self, prefix: &str, operation: &JournalOperation) -> JobsDbResult<JournalEntryId>;

    /// Delete a finished entry
    async fn journal_commit(&self, prefix: &str, id: JournalEntryId) -> JobsDbResult<()>;

    /// Entries not yet committed, in id order
    async fn journal_pending(&self, prefix: &str) -> JobsDbResult<Vec<JournalEntry>>;

    // ---- catalog ----

    /// Every dataset ever created for `prefix`, dropped ones included, in index order
    async fn list_datasets(&self, prefix: &str) -> JobsDbResult<Vec<Dataset>>;

    /// Create the dataset tables with `ddl` and register `index` in `state`.
    /// Returns `false` when the dataset already existed (nothing is changed then).
    async fn create_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        ddl: &[String],
        state: DatasetState,
    ) -> JobsDbResult<bool>;

    /// In one transaction: create `index` active, then seal `seal` if it is
    /// still active. Either half already done is skipped, so a replay can
    /// drive it again. Returns whether `index` was created.
    async fn rotate_dataset(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        schema_version: i64,
        ddl: &[String],
        seal: Option<&DatasetIndex>,
    ) -> JobsDbResult<bool>;

    /// Move a dataset to `state`; sealing stamps `sealed_at` once
    async fn set_dataset_state(&self, prefix: &str, index: &DatasetIndex, state: DatasetState) -> JobsDbResult<()>;

    /// Record the archive handle and mark the dataset archived
    async fn set_archive_handle(&self, prefix: &str, index: &DatasetIndex, handle: &ArchiveHandle) -> JobsDbResult<()>;

    /// Drop the dataset tables and mark it dropped. Idempotent.
    async fn drop_dataset_tables(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<()>;

    /// Copy jobs and status history of `source` into `target`, keeping job ids
    /// and per-job status order. Skips jobs already present in `target`.
    /// Returns the number of jobs copied.
    async fn copy_dataset(&self, prefix: &str, source: &DatasetIndex, target: &DatasetIndex) -> JobsDbResult<u64>;

    /// In one transaction: mark `target` sealed and drop every source
    async fn replace_datasets(&self, prefix: &str, sources: &[DatasetIndex], target: &DatasetIndex) -> JobsDbResult<()>;

    /// Remove every table, sequence and record of `prefix`
    async fn drop_all(&self, prefix: &str) -> JobsDbResult<()>;

    // ---- jobs ----

    /// Insert jobs with their implicit `Waiting` status.
    /// Fails with `DatasetSealed` unless `index` is active at commit time.
    async fn insert_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<Job>>;

    /// Claim up to `limit` jobs across `datasets` (in the given order) in one
    /// transaction, appending `Executing` with the next attempt number.
    async fn claim_jobs(
        &self,
        prefix: &str,
        datasets: &[DatasetIndex],
        filter: &JobFilter,
        limit: usize,
        worker: &str,
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<JobWithStatus>>;

    /// Append status updates in one transaction. Each update is checked
    /// against the job's current status; one invalid update fails the batch
    /// with `InvalidTransition`.
    async fn append_statuses(
        &self,
        prefix: &str,
        updates: &[(DatasetIndex, StatusUpdate)],
        now: DateTime<Utc>,
    ) -> JobsDbResult<Vec<StatusEvent>>;

    /// Jobs of one dataset with id greater than `after`, matching `filter`, in id order
    async fn query_jobs(
        &self,
        prefix: &str,
        index: &DatasetIndex,
        filter: &JobFilter,
        after: Option<JobId>,
        limit: usize,
    ) -> JobsDbResult<Vec<JobWithStatus>>;

    /// Full status history of a job in append order
    async fn job_history(&self, prefix: &str, index: &DatasetIndex, job_id: JobId) -> JobsDbResult<Vec<StatusEvent>>;

    /// Every job of a dataset with its history, in id order
    async fn export_dataset(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<Vec<ArchivedJob>>;

    /// Current-state counts of one dataset
    async fn state_counts(&self, prefix: &str, index: &DatasetIndex) -> JobsDbResult<StateCounts>;
}
