use crate::errors::{SchedulerError, SchedulerResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Counting semaphores for cores and memory.
///
/// A `None` limit leaves that dimension unmetered. Acquisition always takes
/// cores before memory so two waiters can never hold each other's half.
#[derive(Clone, Debug)]
pub struct ResourcePool {
    cores: Option<Arc<Semaphore>>,
    mem_gb: Option<Arc<Semaphore>>,
    max_cores: Option<u32>,
    max_mem_gb: Option<u32>,
}

/// Held for the lifetime of one job. Dropping it returns the capacity.
#[derive(Debug)]
pub struct ResourceLease {
    pub threads: u32,
    pub mem_gb: u32,
    _cores: Option<OwnedSemaphorePermit>,
    _mem_gb: Option<OwnedSemaphorePermit>,
}

impl ResourcePool {
    pub fn new(max_cores: Option<u32>, max_mem_gb: Option<u32>) -> SchedulerResult<Self> {
        if max_cores == Some(0) || max_mem_gb == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "resource limits must be at least 1 when set".to_string(),
            ));
        }
        Ok(Self {
            cores: max_cores.map(|max| Arc::new(Semaphore::new(max as usize))),
            mem_gb: max_mem_gb.map(|max| Arc::new(Semaphore::new(max as usize))),
            max_cores,
            max_mem_gb,
        })
    }

    pub fn max_cores(&self) -> Option<u32> {
        self.max_cores
    }

    pub fn max_mem_gb(&self) -> Option<u32> {
        self.max_mem_gb
    }

    /// Floors requests to 1 and caps them at the configured maxima so a
    /// single job can always eventually be admitted.
    pub fn clamp(&self, threads: u32, mem_gb: u32) -> (u32, u32) {
        let mut threads = threads.max(1);
        let mut mem_gb = mem_gb.max(1);
        if let Some(max) = self.max_cores.filter(|max| threads > *max) {
            info!(requested = threads, max, "clamping thread request to max cores");
            threads = max;
        }
        if let Some(max) = self.max_mem_gb.filter(|max| mem_gb > *max) {
            info!(requested = mem_gb, max, "clamping memory request to max memory");
            mem_gb = max;
        }
        (threads, mem_gb)
    }

    /// Blocks until both dimensions can be granted.
    pub async fn acquire(&self, threads: u32, mem_gb: u32) -> SchedulerResult<ResourceLease> {
        let (threads, mem_gb) = self.clamp(threads, mem_gb);
        let cores = match &self.cores {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_many_owned(threads)
                    .await
                    .map_err(|_| SchedulerError::Shutdown)?,
            ),
            None => None,
        };
        let mem = match &self.mem_gb {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_many_owned(mem_gb)
                    .await
                    .map_err(|_| SchedulerError::Shutdown)?,
            ),
            None => None,
        };
        debug!(
            threads,
            mem_gb,
            cores_in_use = self.cores_in_use(),
            mem_gb_in_use = self.mem_gb_in_use(),
            "resources acquired"
        );
        Ok(ResourceLease {
            threads,
            mem_gb,
            _cores: cores,
            _mem_gb: mem,
        })
    }

    pub fn cores_in_use(&self) -> u32 {
        in_use(&self.cores, self.max_cores)
    }

    pub fn mem_gb_in_use(&self) -> u32 {
        in_use(&self.mem_gb, self.max_mem_gb)
    }

    /// Fails every pending and future acquisition.
    pub fn close(&self) {
        if let Some(sem) = &self.cores {
            sem.close();
        }
        if let Some(sem) = &self.mem_gb {
            sem.close();
        }
    }
}

fn in_use(sem: &Option<Arc<Semaphore>>, max: Option<u32>) -> u32 {
    match (sem, max) {
        (Some(sem), Some(max)) => max.saturating_sub(sem.available_permits() as u32),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_limit_is_rejected_while_none_is_unmetered() {
        assert!(matches!(
            ResourcePool::new(Some(0), None),
            Err(SchedulerError::InvalidConfig(_))
        ));
        let pool = ResourcePool::new(None, None).expect("unmetered pool should build");
        assert_eq!(pool.clamp(64, 512), (64, 512));
    }

    #[test]
    fn clamp_floors_and_caps_requests() {
        let pool = ResourcePool::new(Some(4), Some(8)).expect("pool should build");
        assert_eq!(pool.clamp(0, 0), (1, 1));
        assert_eq!(pool.clamp(16, 32), (4, 8));
        assert_eq!(pool.clamp(2, 3), (2, 3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropping_lease_returns_capacity() {
        let pool = ResourcePool::new(Some(2), Some(2)).expect("pool should build");
        let lease = pool.acquire(2, 2).await.expect("first lease should be granted");
        assert_eq!(pool.cores_in_use(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.acquire(1, 1)).await;
        assert!(blocked.is_err(), "second lease should wait for capacity");

        drop(lease);
        let _again = pool.acquire(1, 1).await.expect("capacity should be returned");
        assert_eq!(pool.cores_in_use(), 1);
        assert_eq!(pool.mem_gb_in_use(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_fails_pending_acquisitions() {
        let pool = ResourcePool::new(Some(1), None).expect("pool should build");
        let _held = pool.acquire(1, 1).await.expect("lease should be granted");
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(1, 1).await })
        };
        tokio::task::yield_now().await;
        pool.close();
        let result = waiter.await.expect("waiter task should join");
        assert!(matches!(result, Err(SchedulerError::Shutdown)));
    }
}
