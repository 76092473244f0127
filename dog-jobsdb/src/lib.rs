//! # dog-jobsdb: Durable Job Storage
//!
//! A persistent job store for pipelines that enqueue, claim and finish large
//! volumes of jobs. Jobs live in a sequence of **datasets**: one writable
//! dataset receives new jobs while older, sealed datasets are drained,
//! archived and eventually dropped, so tables stay small and cleanup is a
//! cheap table drop instead of a mass delete.
//!
//! ## Guarantees
//!
//! - **Append-only statuses**: a job's current state is its latest status row;
//!   history is never rewritten
//! - **Disjoint claims**: concurrent consumers never receive the same job in
//!   the same state
//! - **Ordered ids**: job ids grow with dataset order, so cursors survive
//!   rotation, compaction and pruning
//! - **Journaled structure**: dataset creation, compaction, archival and
//!   pruning are journaled and finished on the next `setup` after a crash
//! - **Versioned schema**: migrations run once, under a cross-process lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_jobsdb::prelude::*;
//!
//! # async fn run() -> JobsDbResult<()> {
//! let db = JobsDb::builder(MemoryBackend::new())
//!     .config(JobsDbConfig::new("gw").with_max_ds_rows(50_000))
//!     .archive_sink(MemoryArchiveSink::new())
//!     .build()?;
//! db.setup(SetupMode::Migrate).await?;
//!
//! let id = db.enqueue(NewJob::new("user-1", b"{}".to_vec())).await?;
//!
//! let claimed = db.claim(ClaimRequest::new("worker-1", 100)).await?;
//! for job in claimed {
//!     db.update_status(StatusUpdate::succeeded(job.job_id())).await?;
//! }
//!
//! let maintenance = db.start_maintenance();
//! # let _ = id;
//! maintenance.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod jobsdb;
pub mod journal;
pub mod lock;
pub mod maintenance;
pub mod migrator;
pub mod observability;
pub mod store;
pub mod types;

pub use crate::jobsdb::{JobsDb, JobsDbBuilder, SetupMode, SetupReport};
pub use archive::{ArchiveManager, ArchiveSink, FileArchiveSink, MemoryArchiveSink};
pub use backend::{MemoryBackend, StorageBackend};
pub use catalog::{DatasetCatalog, RotationTrigger};
pub use config::JobsDbConfig;
pub use error::{JobsDbError, JobsDbResult};
pub use journal::Journal;
pub use lock::{LockGuard, LockManager};
pub use maintenance::{MaintenanceHandle, MaintenanceReport};
pub use migrator::{MigrationContext, MigrationReport, MigrationSet, MigrationStep, Migrator};
pub use observability::{JobsDbMetrics, MetricsSnapshot, ObservabilityLayer};
pub use store::{JobStore, JobStream, RESET_ERROR_CODE};
pub use types::{
    ArchiveHandle, ArchivedJob, ClaimRequest, Dataset, DatasetIndex, DatasetState, Job, JobFilter,
    JobId, JobState, JobWithStatus, JobsDbEvent, JobsDbStats, JournalEntry, JournalEntryId,
    JournalOperation, LockOwner, NewJob, NewStatus, ParameterFilter, QueryCursor, QueryFilter,
    QueryPage, StateCounts, StatusEvent, StatusUpdate,
};

#[cfg(feature = "postgres")]
pub use backend::postgres::PostgresBackend;

#[cfg(feature = "tracing-basic")]
pub use observability::{init_json_tracing, init_tracing};

/// Everything a producer or consumer usually needs
pub mod prelude {
    pub use crate::{JobsDb, JobsDbConfig, MemoryBackend, SetupMode, StorageBackend};

    pub use crate::{
        ClaimRequest, JobFilter, JobId, JobState, JobWithStatus, JobsDbError, JobsDbResult, NewJob,
        QueryCursor, QueryFilter, QueryPage, StatusUpdate,
    };

    pub use crate::{ArchiveSink, FileArchiveSink, MemoryArchiveSink};

    pub use crate::{JobsDbEvent, ObservabilityLayer};

    #[cfg(feature = "postgres")]
    pub use crate::PostgresBackend;
}
