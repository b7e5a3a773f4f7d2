//! Per-chunk retry with exponential backoff.
//!
//! A retried chunk is always re-issued with its original offset and length.
//! Nothing here ever recomputes a range from bytes already received.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;
use crate::planner::ChunkDescriptor;

/// Decides whether a failed chunk operation is re-issued and when.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retry_requests: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
}

impl RetryPolicy {
    /// Policy allowing `max_retry_requests` retries after the first attempt,
    /// with no delay between attempts.
    pub fn new(max_retry_requests: u32) -> Self {
        Self {
            max_retry_requests,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 2.0,
        }
    }

    /// Sets the exponential backoff window.
    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay.max(initial_delay);
        self
    }

    pub fn max_retry_requests(&self) -> u32 {
        self.max_retry_requests
    }

    /// True when `error` is transient and `attempt` retries have not yet
    /// used up the budget.
    pub fn should_retry(&self, error: &TransferError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retry_requests
    }

    /// The descriptor for the next try: same range, attempt count bumped.
    pub fn next_attempt(&self, descriptor: &ChunkDescriptor) -> ChunkDescriptor {
        ChunkDescriptor {
            attempt: descriptor.attempt + 1,
            ..*descriptor
        }
    }

    /// Backoff before retry number `attempt` (1-based): `initial_delay`
    /// doubled per retry and capped at `max_delay`, then randomly spread by
    /// up to 25% either way. Each call draws its own jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let doublings = attempt.saturating_sub(1).min(63) as i32;
        let base = (self.initial_delay.as_secs_f64() * self.backoff_factor.powi(doublings))
            .min(self.max_delay.as_secs_f64());
        let spread: f64 = rand::thread_rng().gen_range(-0.25..=0.25);
        Duration::from_secs_f64(base * (1.0 + spread))
    }

    /// Handles one failed try.
    ///
    /// Returns the descriptor to re-issue after sleeping out the backoff, or
    /// the error that ends the chunk: non-retryable errors pass through
    /// unchanged, an exhausted budget becomes [`TransferError::RetriesExhausted`].
    pub async fn recover(
        &self,
        descriptor: &ChunkDescriptor,
        error: TransferError,
        cancel: &CancellationToken,
    ) -> Result<ChunkDescriptor, TransferError> {
        if !error.is_retryable() {
            return Err(error);
        }
        if !self.should_retry(&error, descriptor.attempt) {
            return Err(TransferError::RetriesExhausted {
                chunk: descriptor.index,
                attempts: descriptor.attempt + 1,
                last: Box::new(error),
            });
        }

        let next = self.next_attempt(descriptor);
        let delay = self.delay_for_attempt(next.attempt);
        warn!(
            chunk = descriptor.index,
            offset = descriptor.offset,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying chunk"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(next),
        }
    }

    /// Runs `op` until it succeeds or fails terminally.
    pub async fn run<T, F, Fut>(
        &self,
        descriptor: ChunkDescriptor,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(ChunkDescriptor) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut current = descriptor;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match op(current).await {
                Ok(value) => return Ok(value),
                Err(e) => current = self.recover(&current, e, cancel).await?,
            }
        }
    }
}
