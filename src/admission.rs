//! Bounded, first-come-first-served admission of in-flight work.
//!
//! [`AdmissionController`] hands out [`AdmissionPermit`]s from a fair
//! `tokio::sync::Semaphore`, so waiters are served in the order they called
//! [`acquire`](AdmissionController::acquire). Dropping a permit frees its slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PoolError;

#[derive(Debug, Default)]
struct Gauges {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    waiting: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    gauges: Arc<Gauges>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            gauges: Arc::new(Gauges::default()),
            capacity,
        }
    }

    /// Wait for a free slot. Fails once the controller is closed.
    pub async fn acquire(&self) -> Result<AdmissionPermit, PoolError> {
        let acquired = {
            let _waiting = WaitingGuard::enter(&self.gauges);
            self.semaphore.clone().acquire_owned().await
        };

        let permit = acquired.map_err(|_| PoolError::AdmissionClosed)?;
        let now = self.gauges.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauges.peak.fetch_max(now, Ordering::SeqCst);

        Ok(AdmissionPermit {
            _permit: permit,
            gauges: Arc::clone(&self.gauges),
        })
    }

    /// Refuse all further admissions. Waiters are woken with an error;
    /// permits already granted stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.gauges.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.gauges.peak.load(Ordering::SeqCst)
    }

    /// Callers currently suspended in `acquire`.
    pub fn waiting(&self) -> usize {
        self.gauges.waiting.load(Ordering::SeqCst)
    }
}

// Decrements `waiting` even when the acquiring future is cancelled.
struct WaitingGuard<'a>(&'a Gauges);

impl<'a> WaitingGuard<'a> {
    fn enter(gauges: &'a Gauges) -> Self {
        gauges.waiting.fetch_add(1, Ordering::SeqCst);
        Self(gauges)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A granted slot. Returned to the controller on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    gauges: Arc<Gauges>,
}

impl AdmissionPermit {
    /// Give the slot back explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // The gauge drops before the semaphore permit (field drop runs after
        // this body), so a waiter woken by the permit never sees a stale count.
        self.gauges.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn acquire_and_release_track_in_flight() {
        let admission = AdmissionController::new(2);
        let a = admission.acquire().await.unwrap();
        let b = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.peak_in_flight(), 2);

        a.release();
        assert_eq!(admission.in_flight(), 1);
        drop(b);
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity() {
        let admission = AdmissionController::new(1);
        let held = admission.acquire().await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), admission.acquire()).await;
        assert!(blocked.is_err(), "second acquire should wait");
        assert_eq!(admission.waiting(), 0);

        drop(held);
        let granted =
            tokio::time::timeout(Duration::from_millis(50), admission.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn grants_are_fifo() {
        let admission = AdmissionController::new(1);
        let held = admission.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let waiter = admission.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = waiter.acquire().await.unwrap();
                order.lock().await.push(i);
                drop(permit);
            }));
            // Let each waiter enqueue before the next one.
            while admission.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn close_rejects_waiters_and_new_callers() {
        let admission = AdmissionController::new(1);
        let held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await })
        };
        while admission.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        admission.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PoolError::AdmissionClosed)
        ));
        assert!(matches!(
            admission.acquire().await,
            Err(PoolError::AdmissionClosed)
        ));
        assert!(admission.is_closed());

        // Granted permits are unaffected.
        assert_eq!(admission.in_flight(), 1);
        drop(held);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_capacity_under_contention() {
        let admission = AdmissionController::new(3);
        let mut handles = Vec::new();
        for _ in 0..64 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move {
                let _permit = admission.acquire().await.unwrap();
                assert!(admission.in_flight() <= 3);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(admission.peak_in_flight() <= 3);
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(AdmissionController::new(0).capacity(), 1);
    }
}
