use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use crate::{
    types::{ArchiveHandle, ArchivedJob},
    JobsDbError, JobsDbResult,
};

/// Cold storage for the contents of archived datasets
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Durably store `jobs` under `key`, replacing anything stored there before
    async fn write(&self, key: &str, jobs: &[ArchivedJob]) -> JobsDbResult<ArchiveHandle>;

    /// Whether the data behind `handle` is present and complete
    async fn confirm(&self, handle: &ArchiveHandle) -> JobsDbResult<bool>;

    async fn read(&self, handle: &ArchiveHandle) -> JobsDbResult<Vec<ArchivedJob>>;

    async fn delete(&self, handle: &ArchiveHandle) -> JobsDbResult<()>;
}

fn handle_for(key: &str, location: String, jobs: &[ArchivedJob]) -> ArchiveHandle {
    ArchiveHandle {
        key: key.to_string(),
        location,
        job_count: jobs.len() as u64,
        status_count: jobs.iter().map(|job| job.history.len() as u64).sum(),
        written_at: Utc::now(),
    }
}

/// Archive sink keeping everything in process memory
#[derive(Clone, Default)]
pub struct MemoryArchiveSink {
    objects: Arc<RwLock<HashMap<String, Vec<ArchivedJob>>>>,
    refuse_confirm: Arc<AtomicBool>,
}

impl MemoryArchiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `confirm` report every write as missing
    pub fn refuse_confirmations(&self, refuse: bool) {
        self.refuse_confirm.store(refuse, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchiveSink {
    async fn write(&self, key: &str, jobs: &[ArchivedJob]) -> JobsDbResult<ArchiveHandle> {
        self.objects.write().insert(key.to_string(), jobs.to_vec());
        Ok(handle_for(key, format!("memory://{key}"), jobs))
    }

    async fn confirm(&self, handle: &ArchiveHandle) -> JobsDbResult<bool> {
        if self.refuse_confirm.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self
            .objects
            .read()
            .get(&handle.key)
            .is_some_and(|jobs| jobs.len() as u64 == handle.job_count))
    }

    async fn read(&self, handle: &ArchiveHandle) -> JobsDbResult<Vec<ArchivedJob>> {
        self.objects
            .read()
            .get(&handle.key)
            .cloned()
            .ok_or_else(|| JobsDbError::archive(format!("no archive at {}", handle.location)))
    }

    async fn delete(&self, handle: &ArchiveHandle) -> JobsDbResult<()> {
        self.objects.write().remove(&handle.key);
        Ok(())
    }
}

/// Archive sink writing one JSON-lines file per dataset under a root directory
#[derive(Debug, Clone)]
pub struct FileArchiveSink {
    root: PathBuf,
}

impl FileArchiveSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> JobsDbResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(JobsDbError::archive(format!("invalid archive key {key:?}")));
        }
        Ok(self.root.join(format!("{key}.jsonl")))
    }

    async fn read_lines(path: &Path) -> JobsDbResult<Vec<ArchivedJob>> {
        let contents = tokio::fs::read_to_string(path).await?;
        contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(JobsDbError::from))
            .collect()
    }
}

#[async_trait]
impl ArchiveSink for FileArchiveSink {
    async fn write(&self, key: &str, jobs: &[ArchivedJob]) -> JobsDbResult<ArchiveHandle> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        for job in jobs {
            let mut line = serde_json::to_vec(job)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        Ok(handle_for(key, path.display().to_string(), jobs))
    }

    async fn confirm(&self, handle: &ArchiveHandle) -> JobsDbResult<bool> {
        let path = self.path_for(&handle.key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        match Self::read_lines(&path).await {
            Ok(jobs) => Ok(jobs.len() as u64 == handle.job_count),
            Err(JobsDbError::Serialization(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, handle: &ArchiveHandle) -> JobsDbResult<Vec<ArchivedJob>> {
        Self::read_lines(&self.path_for(&handle.key)?).await
    }

    async fn delete(&self, handle: &ArchiveHandle) -> JobsDbResult<()> {
        let path = self.path_for(&handle.key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, NewJob, NewStatus};

    fn archived(id: i64) -> ArchivedJob {
        let job = NewJob::new("user", format!("payload-{id}").into_bytes()).into_job(JobId(id), Utc::now());
        let history = vec![NewStatus::waiting(JobId(id), Utc::now()).into_event(id)];
        ArchivedJob { job, history }
    }

    #[tokio::test]
    async fn file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path());
        let jobs = vec![archived(1), archived(2)];

        let handle = sink.write("gw/1", &jobs).await.unwrap();
        assert_eq!(handle.job_count, 2);
        assert_eq!(handle.status_count, 2);
        assert!(dir.path().join("gw/1.jsonl").exists());
        assert!(sink.confirm(&handle).await.unwrap());
        assert_eq!(sink.read(&handle).await.unwrap(), jobs);

        sink.delete(&handle).await.unwrap();
        assert!(!sink.confirm(&handle).await.unwrap());
        sink.delete(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn file_sink_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path());
        assert!(sink.write("../outside", &[]).await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_confirmation_switch() {
        let sink = MemoryArchiveSink::new();
        let handle = sink.write("rt/4", &[archived(9)]).await.unwrap();
        assert!(sink.confirm(&handle).await.unwrap());
        sink.refuse_confirmations(true);
        assert!(!sink.confirm(&handle).await.unwrap());
        assert_eq!(sink.keys(), vec!["rt/4".to_string()]);
    }
}
