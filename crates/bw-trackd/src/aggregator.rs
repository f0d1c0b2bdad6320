use crate::buffer::{BedSlots, EventBuffer};
use crate::dispatch::DispatchHandle;
use crate::presence::PresenceOracle;
use crate::worker;
use bw_core::{NoticeStatus, RoomNotice, SensorReading};
use bw_storage::BedStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type SharedStore = Arc<Mutex<BedStore>>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub retry_interval: Duration,
    pub expire_after: Option<Duration>,
    pub oracle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(60),
            expire_after: None,
            oracle_timeout: Duration::from_secs(8),
        }
    }
}

/// Owns the engine state shared between the ingestion boundary, the
/// scheduler, bed workers, and retry monitors.
pub struct Aggregator {
    pub(crate) config: EngineConfig,
    store: SharedStore,
    pub(crate) buffer: EventBuffer,
    pub(crate) slots: BedSlots,
    oracle: Arc<dyn PresenceOracle>,
    pub(crate) dispatch: DispatchHandle,
}

impl Aggregator {
    pub fn new(
        config: EngineConfig,
        store: SharedStore,
        oracle: Arc<dyn PresenceOracle>,
        dispatch: DispatchHandle,
    ) -> Self {
        Self {
            config,
            store,
            buffer: EventBuffer::new(),
            slots: BedSlots::new(),
            oracle,
            dispatch,
        }
    }

    /// Ingestion entry point. Non-blocking; safe against a concurrent tick.
    pub fn enqueue(&self, reading: SensorReading) {
        debug!(
            event = "reading_buffered",
            bed = %reading.bed_name,
            esp = %reading.esp_id,
            rssi = reading.rssi
        );
        self.buffer.enqueue(reading);
    }

    pub(crate) fn lock_store(&self) -> MutexGuard<'_, BedStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn check_presence(&self, hardware_addr: &str) -> bool {
        match tokio::time::timeout(
            self.config.oracle_timeout,
            self.oracle.is_present(hardware_addr),
        )
        .await
        {
            Ok(present) => present,
            Err(_) => {
                warn!(event = "presence_check_timeout", mac = hardware_addr);
                false
            }
        }
    }

    pub fn spawn_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            event = "scheduler_start",
            tick_ms = self.config.tick_interval.as_millis() as u64,
            retry_secs = self.config.retry_interval.as_secs(),
            expire_secs = self
                .config
                .expire_after
                .map(|age| age.as_secs())
                .unwrap_or(0)
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.clone().tick_once();
                    }
                }
            }
            info!(event = "scheduler_stop");
        });
    }

    /// One scheduling pass: expire stale readings (when configured), then
    /// hand each claimable bed's batch to a fresh worker.
    pub fn tick_once(self: Arc<Self>) {
        if let Some(max_age) = self.config.expire_after {
            self.expire_pass(max_age);
        }

        let batches = self
            .buffer
            .take_batches(|bed_name| self.slots.worker_active(bed_name));
        for (bed_name, batch) in batches {
            if !self.slots.try_acquire_worker(&bed_name) {
                // a retry monitor grabbed the slot between drain and claim
                self.buffer.requeue(batch);
                continue;
            }
            let agg = self.clone();
            tokio::spawn(async move {
                worker::process_batch(&agg, &bed_name, batch).await;
                agg.slots.release_worker(&bed_name);
            });
        }
    }

    fn expire_pass(&self, max_age: Duration) {
        for pending in self.buffer.take_expired(max_age) {
            warn!(
                event = "reading_expired",
                bed = %pending.reading.bed_name,
                esp = %pending.reading.esp_id,
                age_secs = pending.received_at.elapsed().as_secs()
            );
            self.dispatch.enqueue(RoomNotice {
                room: None,
                bed_name: pending.reading.bed_name.clone(),
                status: NoticeStatus::Warning,
                origin_ts: pending.reading.origin_ts,
                link_quality: pending.reading.link_quality,
            });
        }
    }
}
