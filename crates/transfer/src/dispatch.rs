//! Runs chunk operations as tasks, gated by the buffer pool.
//!
//! A task can only be spawned with a pooled buffer in hand, and the pool
//! has one slot per allowed in-flight chunk, so the pool is the
//! concurrency limit. The first task error wins; everything else in
//! flight is aborted.

use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::buffer_pool::{BufferPool, PooledBuffer};

pub(crate) struct Dispatcher {
    pool: BufferPool,
    tasks: JoinSet<Result<(), TransferError>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Dispatcher {
    /// `cancel` is the transfer's token; tasks get a child of it.
    pub(crate) fn new(
        pool: BufferPool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            pool,
            tasks: JoinSet::new(),
            cancel: cancel.child_token(),
            deadline,
        }
    }

    /// Token chunk tasks should watch.
    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for a free buffer, surfacing any chunk failure that happens
    /// in the meantime.
    pub(crate) async fn acquire(&mut self) -> Result<PooledBuffer, TransferError> {
        loop {
            while let Some(joined) = self.tasks.try_join_next() {
                settle(joined)?;
            }

            let buffer = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    settle(joined)?;
                    continue;
                }
                buffer = self.pool.acquire() => buffer?,
            };

            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TransferError::DeadlineExceeded);
            }
            return Ok(buffer);
        }
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Waits for every spawned chunk.
    pub(crate) async fn join_all(&mut self) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => settle(joined)?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Cancels and reaps every task still running.
    pub(crate) async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tasks.shutdown().await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `operation` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = operation => result,
    }
}

fn settle(joined: Result<Result<(), TransferError>, JoinError>) -> Result<(), TransferError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(TransferError::Cancelled),
    }
}
