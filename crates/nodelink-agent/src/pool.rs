//! Bounded work pool for tunnel pumps and proxy executions
//!
//! There is no queue: a job either gets a slot immediately or the submission
//! is rejected with [`PoolError::Busy`], which the caller reports to the
//! gateway. Jobs are plain tokio tasks, so a slot only exists while its job
//! runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::WorkPoolConfig;

/// Work pool submission errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("node busy: work pool full")]
    Busy,

    #[error("work pool is shut down")]
    ShutDown,
}

/// Fixed-ceiling pool of job slots
#[derive(Clone)]
pub struct WorkPool {
    inner: Arc<Inner>,
}

struct Inner {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    size: usize,
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("size", &self.inner.size)
            .field("active", &self.active())
            .finish()
    }
}

impl WorkPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(size)),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                size,
            }),
        }
    }

    /// Pool sized from config, probing the host when no fixed size is set
    pub fn from_config(config: &WorkPoolConfig) -> Self {
        let size = match config.size {
            Some(size) => size,
            None => host_pool_size(config),
        };
        debug!(size, "Work pool created");
        Self::new(size)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Jobs currently holding a slot
    pub fn active(&self) -> usize {
        self.inner.size - self.inner.slots.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Run `job` on a free slot, or fail immediately.
    ///
    /// The job receives a token that fires on pool shutdown; if it has not
    /// finished by then it is dropped, which closes any sockets it owns.
    pub fn try_spawn<F, Fut>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::ShutDown);
        }

        let permit = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Busy,
                TryAcquireError::Closed => PoolError::ShutDown,
            })?;

        let token = self.inner.cancel.child_token();
        let fut = job(token.clone());

        self.inner.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });

        Ok(())
    }

    /// Cancel all jobs, refuse new ones, and wait up to `grace` for them to exit
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.cancel.cancel();
        self.inner.slots.close();
        self.inner.tracker.close();

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tracker.len(),
                "Work pool jobs still running after shutdown grace period"
            );
        }
    }
}

/// Size the pool from CPU count and available memory
pub fn host_pool_size(config: &WorkPoolConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available_memory = system.available_memory();

    pool_size_for(cores, available_memory, config)
}

/// cores x4 when memory is plentiful, cores x2 otherwise, clamped to the configured range
pub fn pool_size_for(cores: usize, available_memory: u64, config: &WorkPoolConfig) -> usize {
    let multiplier = if available_memory > config.high_memory_threshold_bytes {
        4
    } else {
        2
    };
    let max = config.max_size.max(config.min_size);
    (cores.max(1) * multiplier).clamp(config.min_size, max)
}
