use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{backend::StorageBackend, types::LockOwner, JobsDbError, JobsDbResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Grants exclusive access to a lock scope across processes.
///
/// One owner id per manager; guards renew their lease in the background
/// while held, so a crashed process loses the lock after one lease.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn StorageBackend>,
    owner: LockOwner,
    lease: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StorageBackend>, lease: Duration) -> Self {
        Self {
            backend,
            owner: LockOwner::new(),
            lease,
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Single attempt; `None` when another owner holds the scope
    pub async fn try_acquire(&self, scope: &str) -> JobsDbResult<Option<LockGuard>> {
        if self.backend.try_lock(scope, &self.owner, self.lease).await? {
            Ok(Some(LockGuard::start(
                self.backend.clone(),
                scope.to_string(),
                self.owner.clone(),
                self.lease,
            )))
        } else {
            Ok(None)
        }
    }

    /// Poll for the scope with jittered back-off until `timeout` elapses
    pub async fn acquire(&self, scope: &str, timeout: Duration) -> JobsDbResult<LockGuard> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(guard) = self.try_acquire(scope).await? {
                debug!(scope, owner = %self.owner, "lock acquired");
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(JobsDbError::LockTimeout {
                    scope: scope.to_string(),
                    waited,
                });
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let sleep = (backoff + Duration::from_millis(jitter)).min(timeout - waited);
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// A held lock scope. Release explicitly; dropping it unlocks in the background.
pub struct LockGuard {
    backend: Arc<dyn StorageBackend>,
    scope: String,
    owner: LockOwner,
    lease: Duration,
    lost: Arc<AtomicBool>,
    renewer: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn start(backend: Arc<dyn StorageBackend>, scope: String, owner: LockOwner, lease: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let renewer = tokio::spawn(renew_loop(
            backend.clone(),
            scope.clone(),
            owner.clone(),
            lease,
            lost.clone(),
        ));
        Self {
            backend,
            scope,
            owner,
            lease,
            lost,
            renewer: Some(renewer),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Whether a renewal found the lease taken over
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Confirm the lease with the backend before the next structural step.
    ///
    /// Fails with [`JobsDbError::LockLost`] once another owner took the
    /// scope; the guard stays lost from then on.
    pub async fn ensure_held(&self) -> JobsDbResult<()> {
        if !self.is_lost() && self.backend.renew_lock(&self.scope, &self.owner, self.lease).await? {
            return Ok(());
        }
        self.lost.store(true, Ordering::SeqCst);
        warn!(scope = %self.scope, owner = %self.owner, "lock lost, stopping structural operation");
        Err(JobsDbError::LockLost {
            scope: self.scope.clone(),
        })
    }

    pub async fn release(mut self) -> JobsDbResult<()> {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        let result = self.backend.unlock(&self.scope, &self.owner).await;
        debug!(scope = %self.scope, "lock released");
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(renewer) = self.renewer.take() else {
            return;
        };
        renewer.abort();
        let backend = self.backend.clone();
        let scope = std::mem::take(&mut self.scope);
        let owner = self.owner.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = backend.unlock(&scope, &owner).await {
                    warn!(scope = %scope, error = %e, "failed to release dropped lock");
                }
            });
        }
    }
}

async fn renew_loop(
    backend: Arc<dyn StorageBackend>,
    scope: String,
    owner: LockOwner,
    lease: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (lease / 3).max(Duration::from_millis(1));
    loop {
        tokio::time::sleep(period).await;
        match backend.renew_lock(&scope, &owner, lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(scope = %scope, owner = %owner, "lock lease lost");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => warn!(scope = %scope, error = %e, "lock renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn second_owner_times_out() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let first = LockManager::new(backend.clone(), Duration::from_secs(5));
        let second = LockManager::new(backend.clone(), Duration::from_secs(5));

        let guard = first.acquire("gw_jobsdb", Duration::from_millis(50)).await.unwrap();
        let err = second
            .acquire("gw_jobsdb", Duration::from_millis(60))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JobsDbError::LockTimeout { .. }));

        guard.release().await.unwrap();
        let guard = second.acquire("gw_jobsdb", Duration::from_millis(50)).await.unwrap();
        assert_eq!(guard.scope(), "gw_jobsdb");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn held_lease_is_renewed() {
        let backend = MemoryBackend::new();
        let shared: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        let holder = LockManager::new(shared.clone(), Duration::from_millis(60));
        let other = LockManager::new(shared, Duration::from_millis(60));

        let guard = holder.acquire("rt_jobsdb", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(other.try_acquire("rt_jobsdb").await.unwrap().is_none());
        assert!(!guard.is_lost());
        drop(guard);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.lock_holder("rt_jobsdb"), None);
    }

    #[tokio::test]
    async fn taken_over_guard_stops() {
        let backend = MemoryBackend::new();
        let shared: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        let holder = LockManager::new(shared, Duration::from_secs(5));

        let guard = holder.acquire("gw_jobsdb", Duration::from_millis(10)).await.unwrap();
        guard.ensure_held().await.unwrap();

        let thief = LockOwner::from("thief");
        backend
            .take_over_lock("gw_jobsdb", &thief, Duration::from_secs(5))
            .unwrap();
        let err = guard.ensure_held().await.unwrap_err();
        assert!(matches!(err, JobsDbError::LockLost { ref scope } if scope == "gw_jobsdb"));
        assert!(guard.is_lost());

        // Releasing a lost guard leaves the new owner in place
        guard.release().await.unwrap();
        assert_eq!(backend.lock_holder("gw_jobsdb"), Some(thief));
    }
}
