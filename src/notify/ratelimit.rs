// src/notify/ratelimit.rs
//! Global cooperative rate limit: at most one outbound call per interval,
//! across every worker and channel.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for the next free slot. The first call passes immediately.
    ///
    /// Waiters queue on the slot mutex (FIFO), so one caller sleeps at a time.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let mut slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            guard = self.next_slot.lock() => guard,
        };

        if let Some(at) = *slot {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep_until(at) => {}
            }
        }

        *slot = Some(Instant::now() + self.interval);
        Ok(())
    }
}
