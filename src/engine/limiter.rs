//! Outbound rate limiter for text generation.
//!
//! The one resource shared across all match workers. Caps concurrent
//! generation calls with a semaphore and enforces a global minimum
//! spacing between call starts. Slots are reserved under a short lock
//! and the wait happens after the lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::error::{PipelineError, PipelineResult};

pub struct GenerationLimiter {
    permits: Semaphore,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
    granted: AtomicU64,
}

impl GenerationLimiter {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            next_slot: Mutex::new(None),
            granted: AtomicU64::new(0),
        }
    }

    /// No spacing, generous concurrency. For tests and dry runs.
    pub fn unlimited() -> Self {
        Self::new(Semaphore::MAX_PERMITS, Duration::ZERO)
    }

    /// Wait for a call slot. Hold the permit for the duration of the call.
    pub async fn acquire(&self) -> PipelineResult<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::GenerationRejected("generation limiter closed".into()))?;

        let start_at = {
            let mut next = self.next_slot.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };

        tokio::time::sleep_until(start_at).await;
        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(permit)
    }

    /// Total slots handed out since start.
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
