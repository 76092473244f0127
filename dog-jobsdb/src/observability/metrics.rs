use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::JobState;

/// Live counters of one jobsdb instance
#[derive(Debug, Default)]
pub struct JobsDbMetrics {
    jobs_enqueued: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_aborted: AtomicU64,
    jobs_filtered: AtomicU64,
    jobs_released: AtomicU64,
    datasets_created: AtomicU64,
    datasets_archived: AtomicU64,
    datasets_dropped: AtomicU64,
    compactions: AtomicU64,
    lock_timeouts: AtomicU64,
    write_errors: AtomicU64,
}

impl JobsDbMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, count: usize) {
        self.jobs_enqueued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_claimed(&self, count: usize) {
        self.jobs_claimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_status(&self, state: JobState) {
        let counter = match state {
            JobState::Succeeded => &self.jobs_succeeded,
            JobState::Failed => &self.jobs_failed,
            JobState::Aborted => &self.jobs_aborted,
            JobState::Filtered => &self.jobs_filtered,
            JobState::Waiting => &self.jobs_released,
            JobState::Executing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dataset_created(&self) {
        self.datasets_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dataset_archived(&self) {
        self.datasets_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dataset_dropped(&self) {
        self.datasets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_aborted: self.jobs_aborted.load(Ordering::Relaxed),
            jobs_filtered: self.jobs_filtered.load(Ordering::Relaxed),
            jobs_released: self.jobs_released.load(Ordering::Relaxed),
            datasets_created: self.datasets_created.load(Ordering::Relaxed),
            datasets_archived: self.datasets_archived.load(Ordering::Relaxed),
            datasets_dropped: self.datasets_dropped.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`JobsDbMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_aborted: u64,
    pub jobs_filtered: u64,
    /// Executing jobs handed back to `Waiting`
    pub jobs_released: u64,
    pub datasets_created: u64,
    pub datasets_archived: u64,
    pub datasets_dropped: u64,
    pub compactions: u64,
    pub lock_timeouts: u64,
    pub write_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_state() {
        let metrics = JobsDbMetrics::new();
        metrics.record_enqueued(3);
        metrics.record_status(JobState::Succeeded);
        metrics.record_status(JobState::Waiting);
        metrics.record_status(JobState::Executing);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_enqueued, 3);
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.jobs_released, 1);
    }
}
