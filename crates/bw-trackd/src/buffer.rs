use bw_core::SensorReading;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PendingReading {
    pub reading: SensorReading,
    pub received_at: Instant,
}

/// Shared buffer between the ingestion boundary (many producers) and the
/// scheduler tick (one drainer). Readings wait here until their bed's worker
/// slot is free.
#[derive(Default)]
pub struct EventBuffer {
    inner: Mutex<Vec<PendingReading>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, reading: SensorReading) {
        let pending = PendingReading {
            reading,
            received_at: Instant::now(),
        };
        self.lock().push(pending);
    }

    /// Removes and returns per-bed batches, skipping beds for which `skip`
    /// returns true; skipped readings stay queued for a later tick.
    pub fn take_batches(
        &self,
        skip: impl Fn(&str) -> bool,
    ) -> Vec<(String, Vec<PendingReading>)> {
        let mut inner = self.lock();
        let drained = std::mem::take(&mut *inner);
        let mut batches: BTreeMap<String, Vec<PendingReading>> = BTreeMap::new();
        for pending in drained {
            if skip(&pending.reading.bed_name) {
                inner.push(pending);
                continue;
            }
            batches
                .entry(pending.reading.bed_name.clone())
                .or_default()
                .push(pending);
        }
        batches.into_iter().collect()
    }

    /// Puts a batch back at the front of the queue, ahead of readings that
    /// arrived after it.
    pub fn requeue(&self, batch: Vec<PendingReading>) {
        let mut inner = self.lock();
        let tail = std::mem::take(&mut *inner);
        inner.extend(batch);
        inner.extend(tail);
    }

    /// Drains readings older than `max_age`. Only meaningful when the expiry
    /// mode is enabled.
    pub fn take_expired(&self, max_age: Duration) -> Vec<PendingReading> {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut expired = Vec::new();
        inner.retain(|pending| {
            if now.duration_since(pending.received_at) > max_age {
                expired.push(pending.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingReading>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RetryHandle {
    pub id: u64,
    pub cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct BedSlot {
    worker_active: bool,
    retry: Option<RetryHandle>,
}

impl BedSlot {
    fn is_idle(&self) -> bool {
        !self.worker_active && self.retry.is_none()
    }
}

/// Per-bed exclusivity: at most one worker and at most one retry monitor per
/// bed name at any instant. Acquire/release are atomic with respect to the
/// scheduler handing out batches.
#[derive(Default)]
pub struct BedSlots {
    inner: Mutex<BTreeMap<String, BedSlot>>,
    monitor_counter: AtomicU64,
}

impl BedSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_monitor_id(&self) -> u64 {
        self.monitor_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn worker_active(&self, bed_name: &str) -> bool {
        self.lock()
            .get(bed_name)
            .map(|slot| slot.worker_active)
            .unwrap_or(false)
    }

    pub fn try_acquire_worker(&self, bed_name: &str) -> bool {
        let mut inner = self.lock();
        let slot = inner.entry(bed_name.to_string()).or_default();
        if slot.worker_active {
            return false;
        }
        slot.worker_active = true;
        true
    }

    pub fn release_worker(&self, bed_name: &str) {
        let mut inner = self.lock();
        if let Some(slot) = inner.get_mut(bed_name) {
            slot.worker_active = false;
            if slot.is_idle() {
                inner.remove(bed_name);
            }
        }
    }

    /// Registers a retry monitor for the bed. A second monitor for the same
    /// bed is rejected; the existing one keeps running.
    pub fn install_retry(&self, bed_name: &str, handle: RetryHandle) -> bool {
        let mut inner = self.lock();
        let slot = inner.entry(bed_name.to_string()).or_default();
        if slot.retry.is_some() {
            return false;
        }
        slot.retry = Some(handle);
        true
    }

    pub fn has_retry(&self, bed_name: &str) -> bool {
        self.lock()
            .get(bed_name)
            .map(|slot| slot.retry.is_some())
            .unwrap_or(false)
    }

    pub fn cancel_retry(&self, bed_name: &str) {
        let mut inner = self.lock();
        if let Some(slot) = inner.get_mut(bed_name) {
            if let Some(handle) = slot.retry.take() {
                let _ = handle.cancel.send(true);
                info!(event = "retry_monitor_cancelled", bed = bed_name);
            }
            if slot.is_idle() {
                inner.remove(bed_name);
            }
        }
    }

    /// Called by a monitor on exit. The id guard keeps a finished monitor
    /// from clearing a successor installed after its cancellation.
    pub fn clear_retry(&self, bed_name: &str, monitor_id: u64) {
        let mut inner = self.lock();
        if let Some(slot) = inner.get_mut(bed_name) {
            if slot
                .retry
                .as_ref()
                .map(|handle| handle.id == monitor_id)
                .unwrap_or(false)
            {
                slot.retry = None;
                debug!(event = "retry_monitor_cleared", bed = bed_name);
            }
            if slot.is_idle() {
                inner.remove(bed_name);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BedSlot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
