use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("server capacity exceeded")]
    CapacityExceeded,
    #[error("timed out waiting for a pending request to complete")]
    TimedOut,
}

/// Bounds concurrently processed requests to a hard cap with a bounded
/// waiting backlog. Load shedding, not fair queueing: a request either
/// holds a worker slot, waits in the backlog up to the timeout, or is
/// rejected outright.
#[derive(Clone)]
pub struct Throttle {
    workers: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    backlog_timeout: Duration,
}

/// Held for the lifetime of an admitted request; dropping it frees both
/// the worker slot and the backlog slot.
#[derive(Debug)]
pub struct ThrottlePermit {
    _worker: OwnedSemaphorePermit,
    _backlog: OwnedSemaphorePermit,
}

impl Throttle {
    pub fn new(limit: usize, backlog: usize, backlog_timeout: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            workers: Arc::new(Semaphore::new(limit)),
            backlog: Arc::new(Semaphore::new(limit + backlog)),
            backlog_timeout,
        }
    }

    pub async fn acquire(&self) -> Result<ThrottlePermit, ThrottleError> {
        let backlog = self
            .backlog
            .clone()
            .try_acquire_owned()
            .map_err(|_| ThrottleError::CapacityExceeded)?;
        let worker = tokio::time::timeout(self.backlog_timeout, self.workers.clone().acquire_owned())
            .await
            .map_err(|_| ThrottleError::TimedOut)?
            .map_err(|_| ThrottleError::CapacityExceeded)?;
        Ok(ThrottlePermit {
            _worker: worker,
            _backlog: backlog,
        })
    }
}
