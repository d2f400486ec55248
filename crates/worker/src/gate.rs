//! Admission control for generation requests
//!
//! A counting gate with a fixed capacity. Excess callers queue on the gate
//! instead of being rejected; no FIFO order is promised between them.
//! Admission is scoped: the slot is returned when the [`AdmissionPermit`] is
//! dropped, whatever path that happens on.

use chatgate_common::error::{ChatGateError, Result};
use chatgate_common::METRICS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Gate bookkeeping shared between the gate and its permits
#[derive(Debug, Default)]
struct GateCounters {
    /// Permits currently held
    active: AtomicUsize,

    /// Highest value `active` ever reached
    peak: AtomicUsize,

    /// Total admissions since creation
    admitted: AtomicUsize,

    /// Callers currently waiting for a slot
    waiting: AtomicUsize,
}

/// Counting admission gate
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<GateCounters>,
}

/// A held admission slot
///
/// Owned, so it can travel into the blocking job it protects.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

/// Decrements the waiting count when a queued caller leaves, admitted or cancelled
struct WaitingGuard<'a> {
    counters: &'a GateCounters,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counters.waiting.fetch_sub(1, Ordering::SeqCst);
        METRICS.chat.queued_requests.dec();
    }
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` holders at once
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ChatGateError::config("admission gate capacity must be at least 1"));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(GateCounters::default()),
        })
    }

    /// Wait for a free slot and take it
    ///
    /// Cancel-safe: dropping the returned future while it waits gives up the
    /// queue position without consuming a slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        self.counters.waiting.fetch_add(1, Ordering::SeqCst);
        METRICS.chat.queued_requests.inc();
        let waiting = WaitingGuard {
            counters: &self.counters,
        };

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ChatGateError::internal("admission gate closed"))?;
        drop(waiting);

        Ok(self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        self.counters.admitted.fetch_add(1, Ordering::SeqCst);
        METRICS.inference.active_inferences.inc();

        trace!("Admitted request, {} of {} slots in use", active, self.capacity);

        AdmissionPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held permits observed
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Total admissions since creation
    pub fn admitted(&self) -> usize {
        self.counters.admitted.load(Ordering::SeqCst)
    }

    /// Callers currently queued
    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        METRICS.inference.active_inferences.dec();
    }
}
