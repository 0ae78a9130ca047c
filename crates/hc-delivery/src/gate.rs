//! Concurrency Gate
//!
//! Semaphore-backed bound on outstanding requests. A [`GateToken`] is held for
//! the whole life of a delivery unit (first attempt through the last retry)
//! and returns its slot when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hc_common::metric_names;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::DeliveryError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<GateToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::GateClosed)?;
        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GateToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> GateToken {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(metric_names::IN_FLIGHT).set(in_flight as f64);
        debug!(in_flight = in_flight, capacity = self.capacity, "Gate token issued");
        GateToken {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop admitting new units; pending `acquire` calls fail with `GateClosed`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One admitted slot. Dropping the token releases it.
#[derive(Debug)]
pub struct GateToken {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl GateToken {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!(metric_names::IN_FLIGHT).set(remaining as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = ConcurrencyGate::new(2);
        let first = gate.acquire().await.unwrap();
        let second = gate.acquire().await.unwrap();

        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);
        assert!(gate.try_acquire().is_none());

        first.release();
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());

        drop(second);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_waiter_admitted_after_release() {
        let gate = ConcurrencyGate::new(1);
        let token = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(matches!(gate.acquire().await, Err(DeliveryError::GateClosed)));
    }

    #[test]
    fn test_capacity_clamped() {
        assert_eq!(ConcurrencyGate::new(0).capacity(), 1);
        assert_eq!(ConcurrencyGate::new(usize::MAX).capacity(), Semaphore::MAX_PERMITS);
    }
}
