//! C5: bounded, FIFO in-flight concurrency gate.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Wraps a `tokio::sync::Semaphore` to cap the number of requests in flight
/// to upstream at once. `tokio::sync::Semaphore` serves waiters FIFO, which
/// gives the gate fair ordering without any extra bookkeeping.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held while a request is in flight; releases its permit on drop.
pub struct Admission<'a> {
    _permit: SemaphorePermit<'a>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Wait for a free slot. Resolves once a permit is available; the
    /// returned guard releases it automatically when dropped.
    pub async fn acquire(&self) -> Admission<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("concurrency gate semaphore was closed");
        Admission { _permit: permit }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently in use.
    pub fn active_count(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
