use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::{
    archive::{ArchiveManager, ArchiveSink},
    backend::StorageBackend,
    catalog::{release, DatasetCatalog, RotationTrigger},
    config::JobsDbConfig,
    journal::Journal,
    lock::{LockGuard, LockManager},
    maintenance::{self, MaintenanceHandle, MaintenanceReport},
    migrator::{MigrationContext, MigrationReport, MigrationSet, Migrator},
    observability::{MetricsSnapshot, ObservabilityLayer},
    store::{JobStore, JobStream},
    types::{
        ArchiveHandle, ClaimRequest, Dataset, DatasetIndex, JobId, JobWithStatus, JobsDbEvent,
        JobsDbStats, NewJob, QueryCursor, QueryFilter, QueryPage, StatusEvent, StatusUpdate,
    },
    JobsDbError, JobsDbResult,
};

/// How `setup` treats existing tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// Keep existing data and migrate it to the latest schema
    Migrate,
    /// Drop every table of the prefix first
    ClearAll,
}

/// What `setup` did
#[derive(Debug, Clone, PartialEq)]
pub struct SetupReport {
    pub migration: MigrationReport,
    /// Journal entries finished during setup
    pub replayed: usize,
    pub writable: DatasetIndex,
    /// Jobs failed because they were left executing
    pub reset: usize,
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    config: Arc<JobsDbConfig>,
    migrations: Arc<MigrationSet>,
    journal: Journal,
    catalog: Arc<DatasetCatalog>,
    store: Arc<JobStore>,
    archive: Option<ArchiveManager>,
    observability: ObservabilityLayer,
    ready: AtomicBool,
}

/// Handle to one jobsdb table prefix. Cheap to clone.
///
/// Every job operation fails with [`JobsDbError::NotReady`] until
/// [`setup`](Self::setup) has migrated the schema and replayed the journal.
#[derive(Clone)]
pub struct JobsDb {
    inner: Arc<Inner>,
}

impl JobsDb {
    pub fn builder(backend: impl StorageBackend + 'static) -> JobsDbBuilder {
        JobsDbBuilder::new(backend)
    }

    pub fn config(&self) -> &JobsDbConfig {
        &self.inner.config
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> JobsDbResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(JobsDbError::NotReady)
        }
    }

    fn archive_manager(&self) -> JobsDbResult<&ArchiveManager> {
        self.inner
            .archive
            .as_ref()
            .ok_or_else(|| JobsDbError::Config("no archive sink configured".into()))
    }

    pub(crate) fn catalog(&self) -> &DatasetCatalog {
        &self.inner.catalog
    }

    pub(crate) fn has_archive(&self) -> bool {
        self.inner.archive.is_some()
    }

    /// Migrate, replay the journal and open the store for callers
    #[instrument(skip(self), fields(prefix = %self.inner.config.table_prefix), err)]
    pub async fn setup(&self, mode: SetupMode) -> JobsDbResult<SetupReport> {
        let guard = self.inner.catalog.lock().await?;
        let result = self.setup_locked(&guard, mode).await;
        release(guard).await;

        let report = result?;
        self.inner.ready.store(true, Ordering::SeqCst);
        info!(
            prefix = %self.inner.config.table_prefix,
            version = ?report.migration.to,
            writable = %report.writable,
            replayed = report.replayed,
            "jobsdb ready"
        );
        Ok(report)
    }

    async fn setup_locked(&self, guard: &LockGuard, mode: SetupMode) -> JobsDbResult<SetupReport> {
        let inner = &self.inner;
        let prefix = inner.config.table_prefix.as_str();

        if mode == SetupMode::ClearAll {
            guard.ensure_held().await?;
            warn!(prefix, "dropping all jobsdb tables");
            inner.backend.drop_all(prefix).await?;
        }

        inner.catalog.refresh().await?;
        let ctx = MigrationContext {
            prefix: prefix.to_string(),
            datasets: inner
                .catalog
                .list()
                .into_iter()
                .filter(|dataset| dataset.state.has_tables())
                .map(|dataset| dataset.index)
                .collect(),
        };
        guard.ensure_held().await?;
        let migration = Migrator::new(inner.backend.clone(), inner.config.force_set_lower_version)
            .migrate(prefix, &inner.migrations, &ctx)
            .await?;

        let mut replayed = 0;
        for entry in inner.journal.list_pending().await? {
            let mut handled = inner.catalog.replay(guard, &entry).await?;
            if !handled {
                if let Some(archive) = &inner.archive {
                    handled = archive.replay(guard, &entry).await?;
                }
            }
            if handled {
                replayed += 1;
            } else {
                warn!(prefix, entry = %entry.id, op = entry.operation.name(), "no archive sink to replay journal entry, leaving it pending");
            }
        }

        let writable = inner.catalog.ensure_writable_locked(guard).await?;
        let reset = if inner.config.reset_executing_on_startup {
            inner.store.reset_executing().await?
        } else {
            0
        };

        Ok(SetupReport {
            migration,
            replayed,
            writable,
            reset,
        })
    }

    /// Drop every table of the prefix. The handle is not ready afterwards.
    #[instrument(skip(self), fields(prefix = %self.inner.config.table_prefix), err)]
    pub async fn teardown(&self) -> JobsDbResult<()> {
        let guard = self.inner.catalog.lock().await?;
        self.inner.ready.store(false, Ordering::SeqCst);
        let result = match guard.ensure_held().await {
            Ok(()) => self.inner.backend.drop_all(&self.inner.config.table_prefix).await,
            Err(e) => Err(e),
        };
        let refreshed = self.inner.catalog.refresh().await;
        release(guard).await;
        result.and(refreshed)
    }

    // ---- producer ----

    pub async fn enqueue(&self, job: NewJob) -> JobsDbResult<JobId> {
        self.ensure_ready()?;
        self.inner.store.enqueue(job).await
    }

    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> JobsDbResult<Vec<JobId>> {
        self.ensure_ready()?;
        self.inner.store.enqueue_batch(jobs).await
    }

    // ---- consumer ----

    pub async fn claim(&self, request: ClaimRequest) -> JobsDbResult<Vec<JobWithStatus>> {
        self.ensure_ready()?;
        self.inner.store.claim(request).await
    }

    pub async fn update_status(&self, update: StatusUpdate) -> JobsDbResult<StatusEvent> {
        self.ensure_ready()?;
        self.inner.store.update_status(update).await
    }

    pub async fn update_statuses(&self, updates: Vec<StatusUpdate>) -> JobsDbResult<Vec<StatusEvent>> {
        self.ensure_ready()?;
        self.inner.store.update_statuses(updates).await
    }

    /// Lazy scan over every matching job. A stream created before setup yields `NotReady`.
    pub fn query(&self, filter: QueryFilter) -> JobStream {
        self.query_from(filter, None)
    }

    pub fn query_from(&self, filter: QueryFilter, cursor: Option<QueryCursor>) -> JobStream {
        if let Err(e) = self.ensure_ready() {
            return Box::pin(futures::stream::once(async move { Err(e) }));
        }
        self.inner.store.query_from(filter, cursor)
    }

    pub async fn query_page(
        &self,
        filter: &QueryFilter,
        cursor: Option<&QueryCursor>,
        limit: usize,
    ) -> JobsDbResult<QueryPage> {
        self.ensure_ready()?;
        self.inner.store.query_page(filter, cursor, limit).await
    }

    pub async fn get(&self, job_id: JobId) -> JobsDbResult<JobWithStatus> {
        self.ensure_ready()?;
        self.inner.store.get(job_id).await
    }

    pub async fn status_history(&self, job_id: JobId) -> JobsDbResult<Vec<StatusEvent>> {
        self.ensure_ready()?;
        self.inner.store.status_history(job_id).await
    }

    pub async fn stats(&self) -> JobsDbResult<JobsDbStats> {
        self.ensure_ready()?;
        self.inner.store.stats().await
    }

    pub async fn reset_executing(&self) -> JobsDbResult<usize> {
        self.ensure_ready()?;
        self.inner.store.reset_executing().await
    }

    // ---- administration ----

    /// Overwrite the recorded schema version without running migrations.
    ///
    /// The next [`setup`](Self::setup) re-applies every step above `version`.
    /// The handle stays usable; it is up to the operator to run setup again.
    #[instrument(skip(self), fields(prefix = %self.inner.config.table_prefix), err)]
    pub async fn force_schema_version(&self, version: i64) -> JobsDbResult<()> {
        let guard = self.inner.catalog.lock().await?;
        let result = match guard.ensure_held().await {
            Ok(()) => {
                Migrator::new(self.inner.backend.clone(), self.inner.config.force_set_lower_version)
                    .force_version(&self.inner.config.table_prefix, &self.inner.migrations, version)
                    .await
            }
            Err(e) => Err(e),
        };
        release(guard).await;
        result
    }

    /// Datasets of the prefix, dropped ones included, as of the last refresh
    pub async fn datasets(&self) -> JobsDbResult<Vec<Dataset>> {
        self.ensure_ready()?;
        self.inner.catalog.refresh().await?;
        Ok(self.inner.catalog.list())
    }

    /// Rotate to a new writable dataset regardless of size and age
    pub async fn rotate_now(&self) -> JobsDbResult<Option<DatasetIndex>> {
        self.ensure_ready()?;
        self.inner.catalog.rotate_if_needed(RotationTrigger::Explicit).await
    }

    pub async fn rotate_if_needed(&self) -> JobsDbResult<Option<DatasetIndex>> {
        self.ensure_ready()?;
        self.inner.catalog.rotate_if_needed(RotationTrigger::Policy).await
    }

    pub async fn seal(&self, index: &DatasetIndex) -> JobsDbResult<()> {
        self.ensure_ready()?;
        self.inner.catalog.seal(index).await
    }

    pub async fn drop_dataset(&self, index: &DatasetIndex) -> JobsDbResult<()> {
        self.ensure_ready()?;
        self.inner.catalog.drop_dataset(index).await
    }

    /// Merge small finished datasets, bounded by `compaction_max_rows`
    pub async fn compact(&self) -> JobsDbResult<Option<DatasetIndex>> {
        self.ensure_ready()?;
        self.inner
            .catalog
            .compact(self.inner.config.compaction_max_rows)
            .await
    }

    pub async fn archive(&self, index: &DatasetIndex) -> JobsDbResult<ArchiveHandle> {
        self.ensure_ready()?;
        self.archive_manager()?.archive(index).await
    }

    pub async fn prune(&self, index: &DatasetIndex, handle: &ArchiveHandle) -> JobsDbResult<()> {
        self.ensure_ready()?;
        self.archive_manager()?.prune(index, handle).await
    }

    pub async fn archive_eligible(&self) -> JobsDbResult<Vec<DatasetIndex>> {
        self.ensure_ready()?;
        self.archive_manager()?.archive_eligible().await
    }

    pub fn archive_sink(&self) -> Option<&Arc<dyn ArchiveSink>> {
        self.inner.archive.as_ref().map(ArchiveManager::sink)
    }

    /// One maintenance cycle: rotation, then compaction and archival when enabled
    pub async fn run_maintenance(&self) -> JobsDbResult<MaintenanceReport> {
        self.ensure_ready()?;
        maintenance::run_once(self).await
    }

    /// Run maintenance cycles in the background until the handle is shut down
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        maintenance::spawn(self.clone())
    }

    // ---- observability ----

    pub fn subscribe(&self) -> broadcast::Receiver<JobsDbEvent> {
        self.inner.observability.subscribe()
    }

    pub fn event_stream(&self) -> impl futures_core::Stream<Item = JobsDbEvent> + Send + 'static {
        self.inner.observability.event_stream()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.observability.metrics().snapshot()
    }
}

/// Assembles a [`JobsDb`]
pub struct JobsDbBuilder {
    backend: Arc<dyn StorageBackend>,
    config: JobsDbConfig,
    sink: Option<Arc<dyn ArchiveSink>>,
    migrations: MigrationSet,
    observability: ObservabilityLayer,
}

impl JobsDbBuilder {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            config: JobsDbConfig::default(),
            sink: None,
            migrations: MigrationSet::jobsdb(),
            observability: ObservabilityLayer::new(),
        }
    }

    pub fn config(mut self, config: JobsDbConfig) -> Self {
        self.config = config;
        self
    }

    pub fn archive_sink(mut self, sink: impl ArchiveSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn build(self) -> JobsDbResult<JobsDb> {
        self.config.validate()?;
        self.migrations.validate()?;

        let backend = self.backend;
        let config = Arc::new(self.config);
        let migrations = Arc::new(self.migrations);
        let observability = self.observability;
        let journal = Journal::new(backend.clone(), config.table_prefix.clone());
        let locks = LockManager::new(backend.clone(), config.lock_lease);

        let catalog = Arc::new(DatasetCatalog::new(
            backend.clone(),
            config.clone(),
            locks,
            journal.clone(),
            migrations.clone(),
            observability.clone(),
        ));
        let store = Arc::new(JobStore::new(
            backend.clone(),
            config.clone(),
            catalog.clone(),
            observability.clone(),
        ));
        let archive = self.sink.map(|sink| {
            ArchiveManager::new(
                backend.clone(),
                config.clone(),
                catalog.clone(),
                journal.clone(),
                sink,
                observability.clone(),
            )
        });

        Ok(JobsDb {
            inner: Arc::new(Inner {
                backend,
                config,
                migrations,
                journal,
                catalog,
                store,
                archive,
                observability,
                ready: AtomicBool::new(false),
            }),
        })
    }
}
