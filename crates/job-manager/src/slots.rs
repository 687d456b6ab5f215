//! Job slot pool
//!
//! Bounds the number of simultaneously running jobs. A slot is an owned
//! semaphore permit, so it goes back to the pool whenever it is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use common::error::{Error, Result};
use common::utils::{execute_with_timeout, format_duration};
use settings::{JobSettings, SlotPolicyKind};

/// What happens when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// Wait until a slot frees up
    #[default]
    Block,
    /// Wait at most this long, then fail with `Error::Timeout`
    BlockFor(Duration),
    /// Fail immediately with `Error::PoolExhausted`
    Reject,
}

impl SlotPolicy {
    /// Builds the policy from job settings
    pub fn from_settings(settings: &JobSettings) -> Self {
        match (settings.slot_policy, settings.slot_timeout_ms) {
            (SlotPolicyKind::Reject, _) => SlotPolicy::Reject,
            (SlotPolicyKind::Block, Some(ms)) => SlotPolicy::BlockFor(Duration::from_millis(ms)),
            (SlotPolicyKind::Block, None) => SlotPolicy::Block,
        }
    }
}

/// A reserved job slot; dropping it returns the slot
#[derive(Debug)]
pub struct JobSlot {
    _permit: OwnedSemaphorePermit,
}

/// Counter of free job slots bounded by a configured maximum
#[derive(Debug, Clone)]
pub struct JobSlotPool {
    semaphore: Arc<Semaphore>,
    max_jobs: usize,
}

impl JobSlotPool {
    /// Creates a pool with `max_jobs` slots
    pub fn new(max_jobs: usize) -> Result<Self> {
        if max_jobs == 0 {
            return Err(Error::InvalidArgument(
                "Maximum concurrent jobs must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_jobs)),
            max_jobs,
        })
    }

    /// Gets the configured maximum
    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Gets the number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserves a slot according to `policy`
    pub async fn acquire(&self, policy: SlotPolicy) -> Result<JobSlot> {
        let permit = match policy {
            SlotPolicy::Reject => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(Error::PoolExhausted {
                        max_jobs: self.max_jobs,
                    })
                }
                Err(TryAcquireError::Closed) => return Err(pool_closed()),
            },
            SlotPolicy::Block => self.wait().await?,
            SlotPolicy::BlockFor(limit) => {
                execute_with_timeout(self.wait(), limit, "job slot wait")
                    .await
                    .map_err(|e| match e {
                        Error::Timeout(_) => Error::Timeout(format!(
                            "No job slot became free within {}",
                            format_duration(limit)
                        )),
                        other => other,
                    })?
            }
        };

        debug!("Job slot reserved, {} of {} free", self.available(), self.max_jobs);

        Ok(JobSlot { _permit: permit })
    }

    async fn wait(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| pool_closed())
    }
}

fn pool_closed() -> Error {
    Error::Internal("Job slot pool closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_slots_rejected() {
        assert!(JobSlotPool::new(0).is_err());
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let pool = JobSlotPool::new(2).unwrap();
        let _a = pool.acquire(SlotPolicy::Reject).await.unwrap();
        let b = pool.acquire(SlotPolicy::Reject).await.unwrap();
        assert_eq!(pool.available(), 0);

        let err = pool.acquire(SlotPolicy::Reject).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { max_jobs: 2 }));

        drop(b);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire(SlotPolicy::Reject).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let pool = JobSlotPool::new(1).unwrap();
        let _held = pool.acquire(SlotPolicy::Block).await.unwrap();

        let err = pool
            .acquire(SlotPolicy::BlockFor(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("50ms"));
    }

    #[tokio::test]
    async fn test_block_waits_for_release() {
        let pool = JobSlotPool::new(1).unwrap();
        let held = pool.acquire(SlotPolicy::Block).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(SlotPolicy::Block).await.map(|_| ()) })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_policy_from_settings() {
        let mut settings = JobSettings::default();
        assert_eq!(SlotPolicy::from_settings(&settings), SlotPolicy::Block);

        settings.slot_timeout_ms = Some(250);
        assert_eq!(
            SlotPolicy::from_settings(&settings),
            SlotPolicy::BlockFor(Duration::from_millis(250))
        );

        settings.slot_policy = SlotPolicyKind::Reject;
        assert_eq!(SlotPolicy::from_settings(&settings), SlotPolicy::Reject);
    }
}
