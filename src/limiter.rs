//! Process-wide ceiling on concurrently running load jobs.
//!
//! BigQuery caps concurrent requests per method per user, so every delete+load
//! pair runs while holding one permit. Tokio's semaphore hands permits out in
//! FIFO order, which keeps waiters from starving.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 50;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("concurrency limiter is closed")]
pub struct LimiterClosed;

#[derive(Debug, Default)]
struct Gauges {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    waiting: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    gauges: Arc<Gauges>,
}

/// Held for the duration of one load. Dropping it frees the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    gauges: Arc<Gauges>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.gauges.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_LOADS)
    }
}

impl ConcurrencyLimiter {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            gauges: Arc::new(Gauges::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.gauges.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.gauges.peak.load(Ordering::Acquire)
    }

    pub fn waiting(&self) -> usize {
        self.gauges.waiting.load(Ordering::Acquire)
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterClosed> {
        self.gauges.waiting.fetch_add(1, Ordering::AcqRel);
        let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
        self.gauges.waiting.fetch_sub(1, Ordering::AcqRel);
        let permit = acquired.map_err(|_| LimiterClosed)?;

        let now = self.gauges.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.gauges.peak.fetch_max(now, Ordering::AcqRel);
        Ok(LimiterPermit {
            _permit: permit,
            gauges: Arc::clone(&self.gauges),
        })
    }

    /// Refuse all pending and future acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
