//! Bounded concurrency for outbound reads.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Caps the number of reads in flight; excess work waits in FIFO order.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run `work` once a slot is free. The slot is held until `work` settles,
    /// successfully or not.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        // Never closed.
        let _permit = self.semaphore.acquire().await.ok();
        work.await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
