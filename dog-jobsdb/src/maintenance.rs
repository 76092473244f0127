use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{catalog::RotationTrigger, types::DatasetIndex, JobsDb, JobsDbError, JobsDbResult};

/// What one maintenance cycle changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rotated: Option<DatasetIndex>,
    pub compacted: Option<DatasetIndex>,
    /// Datasets archived and pruned
    pub archived: Vec<DatasetIndex>,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.rotated.is_none() && self.compacted.is_none() && self.archived.is_empty()
    }
}

/// Handle for the background maintenance task
pub struct MaintenanceHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<JobsDbResult<()>>,
}

impl MaintenanceHandle {
    /// Stop after the current cycle and wait for the task to exit
    pub async fn shutdown(self) -> JobsDbResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| JobsDbError::Internal(format!("maintenance join error: {e}")))?
    }
}

pub(crate) async fn run_once(db: &JobsDb) -> JobsDbResult<MaintenanceReport> {
    let mut report = MaintenanceReport {
        rotated: db.catalog().rotate_if_needed(RotationTrigger::Policy).await?,
        ..Default::default()
    };
    if db.config().compaction_enabled {
        report.compacted = db.compact().await?;
    }
    if db.has_archive() {
        report.archived = db.archive_eligible().await?;
    }
    Ok(report)
}

fn jittered(base: Duration, jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

pub(crate) fn spawn(db: JobsDb) -> MaintenanceHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(async move {
        let interval = db.config().maintenance_interval;
        let jitter = db.config().maintenance_jitter;
        let prefix = db.config().table_prefix.clone();
        info!(%prefix, ?interval, "maintenance started");

        let mut delay = jittered(interval, jitter);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!(%prefix, "maintenance shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = jittered(interval, jitter);
            match db.run_maintenance().await {
                Ok(report) if report.is_empty() => debug!(%prefix, "maintenance cycle idle"),
                Ok(report) => info!(
                    %prefix,
                    rotated = ?report.rotated,
                    compacted = ?report.compacted,
                    archived = report.archived.len(),
                    "maintenance cycle done"
                ),
                Err(JobsDbError::LockTimeout { scope, waited }) => {
                    // Another process is doing the work
                    debug!(%prefix, %scope, ?waited, "maintenance lock busy");
                    delay = jittered(interval, interval / 2 + jitter);
                }
                Err(JobsDbError::NotReady) => debug!(%prefix, "jobsdb not ready, skipping maintenance"),
                Err(e) => warn!(%prefix, error = %e, "maintenance cycle failed"),
            }
        }

        info!(%prefix, "maintenance stopped");
        Ok(())
    });

    MaintenanceHandle {
        shutdown_tx,
        join_handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_bounds() {
        let base = Duration::from_millis(100);
        assert_eq!(jittered(base, Duration::ZERO), base);
        for _ in 0..50 {
            let delay = jittered(base, Duration::from_millis(20));
            assert!(delay >= base && delay <= base + Duration::from_millis(20));
        }
    }
}
