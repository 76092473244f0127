use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures_core::Stream;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::StorageBackend,
    catalog::DatasetCatalog,
    config::JobsDbConfig,
    observability::ObservabilityLayer,
    types::{
        ClaimRequest, DatasetIndex, JobFilter, JobId, JobState, JobWithStatus, JobsDbEvent,
        JobsDbStats, NewJob, QueryCursor, QueryFilter, QueryPage, StatusEvent, StatusUpdate,
    },
    JobsDbError, JobsDbResult,
};

/// Lazily paged scan over jobs in (dataset index, job id) order
pub type JobStream = Pin<Box<dyn Stream<Item = JobsDbResult<JobWithStatus>> + Send + 'static>>;

/// Attempts of a read that found the catalog snapshot out of date
const STALE_READ_ATTEMPTS: usize = 3;

/// First and longest pause of an enqueue waiting for a writable dataset
const WRITABLE_WAIT_INITIAL: Duration = Duration::from_millis(10);
const WRITABLE_WAIT_MAX: Duration = Duration::from_millis(200);

/// Error code of statuses written by [`JobStore::reset_executing`]
pub const RESET_ERROR_CODE: &str = "jobsdb_reset";

/// Job CRUD over the datasets of the catalog
pub struct JobStore {
    backend: Arc<dyn StorageBackend>,
    config: Arc<JobsDbConfig>,
    catalog: Arc<DatasetCatalog>,
    observability: ObservabilityLayer,
}

impl JobStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: Arc<JobsDbConfig>,
        catalog: Arc<DatasetCatalog>,
        observability: ObservabilityLayer,
    ) -> Self {
        Self {
            backend,
            config,
            catalog,
            observability,
        }
    }

    fn prefix(&self) -> &str {
        &self.config.table_prefix
    }

    pub async fn enqueue(&self, job: NewJob) -> JobsDbResult<JobId> {
        let ids = self.enqueue_batch(vec![job]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| JobsDbError::Internal("enqueue returned no id".into()))
    }

    /// Store all jobs in the writable dataset, or none of them.
    ///
    /// With no writable dataset in sight the call waits, up to the lock
    /// timeout, for a setup or replay to create one.
    #[instrument(skip(self, jobs), fields(prefix = %self.config.table_prefix, count = jobs.len()), err)]
    pub async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> JobsDbResult<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.catalog.refresh_if_stale().await?;

        let deadline = Instant::now() + self.config.lock_timeout;
        let mut wait = WRITABLE_WAIT_INITIAL;
        let mut retries = 0;
        loop {
            let retry = match self.catalog.current_writable() {
                None => None,
                Some(writable) => {
                    let index = writable.index;
                    match self
                        .backend
                        .insert_jobs(self.prefix(), &index, jobs.clone(), Utc::now())
                        .await
                    {
                        Ok(inserted) => {
                            let job_ids: Vec<JobId> = inserted.iter().map(|job| job.job_id).collect();
                            self.observability.metrics().record_enqueued(job_ids.len());
                            self.observability.emit(JobsDbEvent::Enqueued {
                                dataset: index.clone(),
                                job_ids: job_ids.clone(),
                                at: Utc::now(),
                            });
                            debug!(dataset = %index, count = job_ids.len(), "enqueued jobs");
                            return Ok(job_ids);
                        }
                        Err(JobsDbError::DatasetSealed(_) | JobsDbError::DatasetNotFound(_)) => Some(index),
                        Err(e) => {
                            if matches!(e, JobsDbError::Write(_)) {
                                self.observability.metrics().record_write_error();
                            }
                            return Err(e);
                        }
                    }
                }
            };

            match retry {
                Some(stale) => {
                    if retries >= self.config.enqueue_retries {
                        self.observability.metrics().record_write_error();
                        return Err(JobsDbError::write(format!(
                            "writable dataset kept moving after {} attempts",
                            retries + 1
                        )));
                    }
                    retries += 1;
                    debug!(%stale, attempt = retries, "writable dataset moved, retrying enqueue");
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.observability.metrics().record_write_error();
                        return Err(JobsDbError::write(format!(
                            "no writable dataset within {:?}",
                            self.config.lock_timeout
                        )));
                    }
                    debug!(?wait, "no writable dataset, waiting");
                    tokio::time::sleep(wait.min(deadline - now)).await;
                    wait = (wait * 2).min(WRITABLE_WAIT_MAX);
                }
            }
            self.catalog.refresh().await?;
        }
    }

    /// Claim a batch of jobs for `request.worker`
    #[instrument(skip(self, request), fields(prefix = %self.config.table_prefix, worker = %request.worker, limit = request.limit), err)]
    pub async fn claim(&self, request: ClaimRequest) -> JobsDbResult<Vec<JobWithStatus>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = with_deadline(request.timeout, async {
            self.catalog.refresh_if_stale().await?;
            let datasets: Vec<DatasetIndex> = self
                .catalog
                .readable()
                .into_iter()
                .map(|dataset| dataset.index)
                .collect();
            self.backend
                .claim_jobs(
                    self.prefix(),
                    &datasets,
                    &request.filter,
                    request.limit,
                    &request.worker,
                    Utc::now(),
                )
                .await
        })
        .await?;

        if !claimed.is_empty() {
            self.observability.metrics().record_claimed(claimed.len());
            self.observability.emit(JobsDbEvent::Claimed {
                worker: request.worker.clone(),
                job_ids: claimed.iter().map(JobWithStatus::job_id).collect(),
                at: Utc::now(),
            });
        }
        Ok(claimed)
    }

    pub async fn update_status(&self, update: StatusUpdate) -> JobsDbResult<StatusEvent> {
        let mut appended = self.update_statuses(vec![update]).await?;
        appended
            .pop()
            .ok_or_else(|| JobsDbError::Internal("status update returned nothing".into()))
    }

    /// Apply a batch of transitions atomically
    #[instrument(skip(self, updates), fields(prefix = %self.config.table_prefix, count = updates.len()), err)]
    pub async fn update_statuses(&self, updates: Vec<StatusUpdate>) -> JobsDbResult<Vec<StatusEvent>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        self.catalog.refresh_if_stale().await?;

        let mut attempt = 0;
        let appended = loop {
            attempt += 1;
            let result = match self.locate_updates(&updates) {
                Ok(located) => {
                    self.backend
                        .append_statuses(self.prefix(), &located, Utc::now())
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(appended) => break appended,
                Err(e) if attempt < STALE_READ_ATTEMPTS && snapshot_may_be_stale(&e) => {
                    self.catalog.refresh().await?;
                }
                Err(JobsDbError::DatasetNotFound(_)) => {
                    return Err(JobsDbError::InvalidTransition {
                        job_id: updates[0].job_id,
                        from: None,
                        to: updates[0].state,
                    });
                }
                Err(e) => return Err(e),
            }
        };

        let now = Utc::now();
        for event in &appended {
            self.observability.metrics().record_status(event.state);
            self.observability.emit(JobsDbEvent::StatusUpdated {
                job_id: event.job_id,
                state: event.state,
                at: now,
            });
        }
        Ok(appended)
    }

    fn locate_updates(&self, updates: &[StatusUpdate]) -> JobsDbResult<Vec<(DatasetIndex, StatusUpdate)>> {
        updates
            .iter()
            .map(|update| match self.catalog.locate(update.job_id) {
                Some(dataset) => Ok((dataset.index, update.clone())),
                None => Err(JobsDbError::InvalidTransition {
                    job_id: update.job_id,
                    from: None,
                    to: update.state,
                }),
            })
            .collect()
    }

    /// One page of jobs matching `filter`, starting after `cursor`
    #[instrument(skip(self, filter), fields(prefix = %self.config.table_prefix), err)]
    pub async fn query_page(
        &self,
        filter: &QueryFilter,
        cursor: Option<&QueryCursor>,
        limit: usize,
    ) -> JobsDbResult<QueryPage> {
        self.catalog.refresh_if_stale().await?;
        let after = cursor.map(|cursor| cursor.last_job_id);

        let mut attempt = 0;
        let jobs = loop {
            attempt += 1;
            match self.collect_page(filter, after, limit).await {
                Ok(jobs) => break jobs,
                Err(e @ JobsDbError::DatasetNotFound(_)) => {
                    if attempt >= STALE_READ_ATTEMPTS {
                        return Err(e);
                    }
                    self.catalog.refresh().await?;
                }
                Err(e) => return Err(e),
            }
        };

        let next = jobs.last().map(QueryCursor::after);
        Ok(QueryPage {
            has_more: limit > 0 && jobs.len() >= limit,
            next,
            jobs,
        })
    }

    async fn collect_page(
        &self,
        filter: &JobFilter,
        after: Option<JobId>,
        limit: usize,
    ) -> JobsDbResult<Vec<JobWithStatus>> {
        let mut jobs = Vec::new();
        for dataset in self.catalog.readable() {
            if jobs.len() >= limit {
                break;
            }
            // Sealed datasets do not grow, so their id range is final
            let behind_cursor = !dataset.is_writable()
                && matches!((dataset.max_job_id, after), (Some(max), Some(after)) if max <= after);
            if behind_cursor {
                continue;
            }
            let batch = self
                .backend
                .query_jobs(self.prefix(), &dataset.index, filter, after, limit - jobs.len())
                .await?;
            jobs.extend(batch);
        }
        Ok(jobs)
    }

    /// Every job matching `filter`, fetched page by page as the stream is polled
    pub fn query(self: &Arc<Self>, filter: QueryFilter) -> JobStream {
        self.query_from(filter, None)
    }

    /// Like [`query`](Self::query), resuming after `cursor`
    pub fn query_from(self: &Arc<Self>, filter: QueryFilter, cursor: Option<QueryCursor>) -> JobStream {
        let page_size = self.config.query_page_size;
        let state = (self.clone(), filter, cursor, false);
        let pages = stream::unfold(state, move |(store, filter, cursor, finished)| async move {
            if finished {
                return None;
            }
            match store.query_page(&filter, cursor.as_ref(), page_size).await {
                Ok(page) => {
                    let finished = page.is_last();
                    let cursor = page.next.clone().or(cursor);
                    let items: Vec<JobsDbResult<JobWithStatus>> = page.jobs.into_iter().map(Ok).collect();
                    Some((stream::iter(items), (store, filter, cursor, finished)))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), (store, filter, cursor, true))),
            }
        });
        Box::pin(pages.flatten())
    }

    /// A job with its current status
    pub async fn get(&self, job_id: JobId) -> JobsDbResult<JobWithStatus> {
        self.catalog.refresh_if_stale().await?;
        for attempt in 1..=STALE_READ_ATTEMPTS {
            if let Some(dataset) = self.catalog.locate(job_id) {
                let before = JobId(job_id.0.saturating_sub(1));
                match self
                    .backend
                    .query_jobs(self.prefix(), &dataset.index, &JobFilter::new(), Some(before), 1)
                    .await
                {
                    Ok(found) => {
                        if let Some(found) = found.into_iter().find(|found| found.job.job_id == job_id) {
                            return Ok(found);
                        }
                    }
                    Err(JobsDbError::DatasetNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if attempt < STALE_READ_ATTEMPTS {
                self.catalog.refresh().await?;
            }
        }
        Err(JobsDbError::JobNotFound(job_id))
    }

    /// Every status a job went through, in append order
    pub async fn status_history(&self, job_id: JobId) -> JobsDbResult<Vec<StatusEvent>> {
        self.catalog.refresh_if_stale().await?;
        for attempt in 1..=STALE_READ_ATTEMPTS {
            if let Some(dataset) = self.catalog.locate(job_id) {
                match self
                    .backend
                    .job_history(self.prefix(), &dataset.index, job_id)
                    .await
                {
                    Ok(history) => return Ok(history),
                    Err(JobsDbError::DatasetNotFound(_) | JobsDbError::JobNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if attempt < STALE_READ_ATTEMPTS {
                self.catalog.refresh().await?;
            }
        }
        Err(JobsDbError::JobNotFound(job_id))
    }

    /// Current-state counts per readable dataset
    pub async fn stats(&self) -> JobsDbResult<JobsDbStats> {
        self.catalog.refresh().await?;
        let mut stats = JobsDbStats::default();
        for dataset in self.catalog.readable() {
            match self.backend.state_counts(self.prefix(), &dataset.index).await {
                Ok(counts) => {
                    stats.totals.merge(&counts);
                    stats.datasets.push((dataset.index, counts));
                }
                Err(JobsDbError::DatasetNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }

    /// Fail every job still marked executing, e.g. by a process that crashed mid-batch
    #[instrument(skip(self), fields(prefix = %self.config.table_prefix), err)]
    pub async fn reset_executing(&self) -> JobsDbResult<usize> {
        self.catalog.refresh().await?;
        let filter = JobFilter::new().states([JobState::Executing]);
        let page_size = self.config.query_page_size;
        let now = Utc::now();
        let mut reset = 0;

        for dataset in self.catalog.readable() {
            loop {
                let stuck = self
                    .backend
                    .query_jobs(self.prefix(), &dataset.index, &filter, None, page_size)
                    .await?;
                if stuck.is_empty() {
                    break;
                }
                let updates: Vec<(DatasetIndex, StatusUpdate)> = stuck
                    .iter()
                    .map(|found| {
                        let update = StatusUpdate::failed(found.job_id(), RESET_ERROR_CODE)
                            .with_retry_time(now)
                            .with_error_response(json!({
                                "reason": "job was executing when jobsdb started",
                                "worker": found.status.worker,
                            }));
                        (dataset.index.clone(), update)
                    })
                    .collect();
                self.backend
                    .append_statuses(self.prefix(), &updates, now)
                    .await?;
                reset += updates.len();
            }
        }

        if reset > 0 {
            warn!(prefix = self.prefix(), count = reset, "reset jobs left executing");
        } else {
            info!(prefix = self.prefix(), "no executing jobs to reset");
        }
        Ok(reset)
    }
}

/// Errors after which a fresh catalog snapshot may locate the job elsewhere
fn snapshot_may_be_stale(err: &JobsDbError) -> bool {
    matches!(
        err,
        JobsDbError::DatasetNotFound(_) | JobsDbError::InvalidTransition { from: None, .. }
    )
}

/// Run `fut` under an optional deadline. Dropping the future on expiry
/// rolls back whatever transaction it had open.
pub(crate) async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> JobsDbResult<T>
where
    F: Future<Output = JobsDbResult<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| JobsDbError::DeadlineExceeded(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_expiry() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, JobsDbError>(())
        };
        let err = with_deadline(Some(Duration::from_millis(10)), slow).await.unwrap_err();
        assert!(matches!(err, JobsDbError::DeadlineExceeded(_)));
        assert!(with_deadline(None, async { Ok::<_, JobsDbError>(1) }).await.is_ok());
    }
}
