//! Semaphore-based admission gate.
//!
//! A slot is one permit on a Tokio semaphore. Tokio's semaphore is fair:
//! waiters are queued and served in the order they called `acquire`, so a
//! burst of late callers can never starve an earlier one.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A granted admission slot; returned to the gate when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// The gate was closed by shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("admission gate is closed")]
pub struct GateClosed;

/// FIFO concurrency limiter for executions.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Acquire a slot without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(AdmissionPermit { _permit: permit })
    }

    /// Acquire a slot, queueing behind earlier callers if none is free.
    pub async fn acquire(&self) -> Result<AdmissionPermit, GateClosed> {
        if self.semaphore.available_permits() == 0 {
            debug!(capacity = self.capacity, "Pool saturated, waiting for a slot");
        }
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Stop admitting: pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let gate = AdmissionGate::new(2);
        let a = gate.try_acquire();
        let b = gate.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.available(), 0);
        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.try_acquire().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for label in ["A", "B", "C"] {
            let gate = Arc::clone(&gate);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire().await.unwrap();
                tx.send(label).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
            // Let this waiter enqueue before the next one arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(tx);
        drop(held);

        let mut order = Vec::new();
        while let Some(label) = rx.recv().await {
            order.push(label);
        }
        assert_eq!(order, vec!["A", "B", "C"]);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_fails_pending_waiters() {
        let gate = Arc::new(AdmissionGate::new(1));
        let _held = gate.try_acquire().unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released by close")
            .unwrap();
        assert_eq!(result.unwrap_err(), GateClosed);
        assert!(gate.is_closed());
    }
}
