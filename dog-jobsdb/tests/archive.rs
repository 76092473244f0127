use std::time::Duration;

use async_trait::async_trait;

use dog_jobsdb::{
    ArchiveHandle, ArchiveSink, ArchivedJob, ClaimRequest, DatasetIndex, DatasetState,
    FileArchiveSink, JobFilter, JobId, JobState, JobsDb, JobsDbConfig, JobsDbError, JobsDbResult,
    LockOwner, MemoryArchiveSink, MemoryBackend, NewJob, SetupMode, StatusUpdate, StorageBackend,
};

fn idx(s: &str) -> DatasetIndex {
    s.parse().unwrap()
}

fn config() -> JobsDbConfig {
    JobsDbConfig::new("gw").with_archive_retention(Duration::ZERO)
}

async fn open_with_sink(backend: &MemoryBackend, sink: impl ArchiveSink + 'static) -> JobsDb {
    let db = JobsDb::builder(backend.clone())
        .config(config())
        .archive_sink(sink)
        .build()
        .unwrap();
    db.setup(SetupMode::Migrate).await.unwrap();
    db
}

/// Jobs 1..=3 finished in sealed dataset 1, jobs 4..=5 waiting in dataset 2
async fn seed(db: &JobsDb) {
    db.enqueue_batch((1..=3).map(|n| NewJob::new("user", vec![n])).collect())
        .await
        .unwrap();
    let claimed = db.claim(ClaimRequest::new("w", 10)).await.unwrap();
    let updates = claimed
        .iter()
        .map(|found| StatusUpdate::succeeded(found.job_id()))
        .collect();
    db.update_statuses(updates).await.unwrap();
    db.rotate_now().await.unwrap();
    db.enqueue_batch((4..=5).map(|n| NewJob::new("user", vec![n])).collect())
        .await
        .unwrap();
}

fn state_of(datasets: &[dog_jobsdb::Dataset], index: &DatasetIndex) -> Option<DatasetState> {
    datasets
        .iter()
        .find(|dataset| &dataset.index == index)
        .map(|dataset| dataset.state)
}

/// Archiving then pruning a dataset leaves open cursors valid
#[tokio::test]
async fn test_archive_and_prune_with_open_cursor() {
    let sink = MemoryArchiveSink::new();
    let db = open_with_sink(&MemoryBackend::new(), sink.clone()).await;
    seed(&db).await;

    let first = db.query_page(&JobFilter::new(), None, 1).await.unwrap();
    assert_eq!(first.jobs[0].job_id(), JobId(1));
    let cursor = first.next.unwrap();

    let pruned = db.archive_eligible().await.unwrap();
    assert_eq!(pruned, vec![idx("1")]);
    assert_eq!(sink.keys(), vec!["gw/1".to_string()]);
    assert_eq!(state_of(&db.datasets().await.unwrap(), &idx("1")), Some(DatasetState::Dropped));

    let rest = db.query_page(&JobFilter::new(), Some(&cursor), 10).await.unwrap();
    let ids: Vec<i64> = rest.jobs.iter().map(|found| found.job_id().0).collect();
    assert_eq!(ids, vec![4, 5]);
    assert!(matches!(db.get(JobId(2)).await, Err(JobsDbError::JobNotFound(_))));

    // Nothing left to archive
    let metrics = db.metrics();
    assert_eq!(metrics.datasets_archived, 1);
    assert_eq!(metrics.datasets_dropped, 1);
    assert!(db.archive_eligible().await.unwrap().is_empty());
}

/// A prune whose archive is not confirmed keeps the dataset readable
#[tokio::test]
async fn test_unconfirmed_prune_keeps_dataset() {
    let sink = MemoryArchiveSink::new();
    let db = open_with_sink(&MemoryBackend::new(), sink.clone()).await;
    seed(&db).await;

    sink.refuse_confirmations(true);
    let err = db.archive_eligible().await.unwrap_err();
    assert!(matches!(err, JobsDbError::Archive(_)));

    let datasets = db.datasets().await.unwrap();
    assert_eq!(state_of(&datasets, &idx("1")), Some(DatasetState::Archived));
    let handle = datasets
        .iter()
        .find(|dataset| dataset.index == idx("1"))
        .and_then(|dataset| dataset.archive_handle.clone())
        .unwrap();
    assert_eq!(handle.job_count, 3);
    assert_eq!(handle.status_count, 9);
    assert_eq!(db.get(JobId(2)).await.unwrap().state(), JobState::Succeeded);
    assert!(matches!(
        db.prune(&idx("1"), &handle).await,
        Err(JobsDbError::Archive(_))
    ));

    // Archiving again is a no-op returning the recorded handle
    assert_eq!(db.archive(&idx("1")).await.unwrap(), handle);

    sink.refuse_confirmations(false);
    assert_eq!(db.archive_eligible().await.unwrap(), vec![idx("1")]);
    assert_eq!(state_of(&db.datasets().await.unwrap(), &idx("1")), Some(DatasetState::Dropped));
}

/// Only sealed, fully processed datasets can be archived
#[tokio::test]
async fn test_archive_preconditions() {
    let db = open_with_sink(&MemoryBackend::new(), MemoryArchiveSink::new()).await;
    seed(&db).await;

    assert!(matches!(
        db.archive(&idx("2")).await,
        Err(JobsDbError::InvalidState(_))
    ));
    db.rotate_now().await.unwrap();
    // Dataset 2 is sealed now but its jobs are still waiting
    assert!(matches!(
        db.archive(&idx("2")).await,
        Err(JobsDbError::InvalidState(_))
    ));
    assert_eq!(db.archive_eligible().await.unwrap(), vec![idx("1")]);

    let without_sink = JobsDb::builder(MemoryBackend::new())
        .config(config())
        .build()
        .unwrap();
    without_sink.setup(SetupMode::Migrate).await.unwrap();
    assert!(matches!(
        without_sink.archive_eligible().await,
        Err(JobsDbError::Config(_))
    ));
}

/// Datasets inside the retention window stay put
#[tokio::test]
async fn test_retention_window() {
    let db = JobsDb::builder(MemoryBackend::new())
        .config(JobsDbConfig::new("gw").with_archive_retention(Duration::from_secs(3600)))
        .archive_sink(MemoryArchiveSink::new())
        .build()
        .unwrap();
    db.setup(SetupMode::Migrate).await.unwrap();
    seed(&db).await;

    assert!(db.archive_eligible().await.unwrap().is_empty());
}

/// An archival interrupted before it recorded its handle is redone on setup
#[tokio::test]
async fn test_replay_interrupted_archive() {
    let backend = MemoryBackend::new();
    let sink = MemoryArchiveSink::new();
    let db = open_with_sink(&backend, sink.clone()).await;
    seed(&db).await;

    backend
        .journal_begin(
            "gw",
            &dog_jobsdb::JournalOperation::ArchiveDataset { index: idx("1") },
        )
        .await
        .unwrap();

    // Without a sink the entry stays pending
    let blind = JobsDb::builder(backend.clone()).config(config()).build().unwrap();
    assert_eq!(blind.setup(SetupMode::Migrate).await.unwrap().replayed, 0);
    assert_eq!(backend.journal_pending("gw").await.unwrap().len(), 1);

    let restarted = open_with_sink(&backend, sink.clone()).await;
    assert!(backend.journal_pending("gw").await.unwrap().is_empty());
    assert_eq!(
        state_of(&restarted.datasets().await.unwrap(), &idx("1")),
        Some(DatasetState::Archived)
    );
    assert_eq!(sink.keys(), vec!["gw/1".to_string()]);
}

/// Sink whose writes are slow enough for another process to take over the prefix lock
#[derive(Clone)]
struct StallingSink {
    inner: MemoryArchiveSink,
    backend: MemoryBackend,
}

#[async_trait]
impl ArchiveSink for StallingSink {
    async fn write(&self, key: &str, jobs: &[ArchivedJob]) -> JobsDbResult<ArchiveHandle> {
        let handle = self.inner.write(key, jobs).await?;
        self.backend
            .take_over_lock("gw_jobsdb", &LockOwner::from("other"), Duration::from_secs(30))?;
        Ok(handle)
    }

    async fn confirm(&self, handle: &ArchiveHandle) -> JobsDbResult<bool> {
        self.inner.confirm(handle).await
    }

    async fn read(&self, handle: &ArchiveHandle) -> JobsDbResult<Vec<ArchivedJob>> {
        self.inner.read(handle).await
    }

    async fn delete(&self, handle: &ArchiveHandle) -> JobsDbResult<()> {
        self.inner.delete(handle).await
    }
}

/// Losing the lock mid-archival stops before the dataset changes, and the next setup finishes it
#[tokio::test]
async fn test_lost_lock_stops_archival() {
    let backend = MemoryBackend::new();
    let inner = MemoryArchiveSink::new();
    let stalling = StallingSink {
        inner: inner.clone(),
        backend: backend.clone(),
    };
    let db = open_with_sink(&backend, stalling).await;
    seed(&db).await;

    let err = db.archive(&idx("1")).await.unwrap_err();
    assert!(matches!(err, JobsDbError::LockLost { .. }));
    assert!(err.is_retryable());

    let datasets = db.datasets().await.unwrap();
    assert_eq!(state_of(&datasets, &idx("1")), Some(DatasetState::Sealed));
    let pending = backend.journal_pending("gw").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation.name(), "archive_dataset");
    assert_eq!(backend.lock_holder("gw_jobsdb"), Some(LockOwner::from("other")));

    // The other process goes away; a restart replays the entry
    backend.unlock("gw_jobsdb", &LockOwner::from("other")).await.unwrap();
    let restarted = open_with_sink(&backend, inner.clone()).await;
    assert!(backend.journal_pending("gw").await.unwrap().is_empty());
    assert_eq!(
        state_of(&restarted.datasets().await.unwrap(), &idx("1")),
        Some(DatasetState::Archived)
    );
    assert_eq!(inner.keys(), vec!["gw/1".to_string()]);
}

/// The file sink writes one JSON-lines file per dataset
#[tokio::test]
async fn test_file_sink_archive() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileArchiveSink::new(dir.path());
    let db = open_with_sink(&MemoryBackend::new(), sink.clone()).await;
    seed(&db).await;

    let handle = db.archive(&idx("1")).await.unwrap();
    assert!(dir.path().join("gw/1.jsonl").exists());
    let archived = sink.read(&handle).await.unwrap();
    let ids: Vec<i64> = archived.iter().map(|entry| entry.job.job_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(archived.iter().all(|entry| entry.history.len() == 3));

    db.prune(&idx("1"), &handle).await.unwrap();
    assert_eq!(state_of(&db.datasets().await.unwrap(), &idx("1")), Some(DatasetState::Dropped));
    // Pruning twice is harmless
    db.prune(&idx("1"), &handle).await.unwrap();
}
