use crate::aggregator::Aggregator;
use crate::buffer::RetryHandle;
use crate::worker;
use bw_core::SensorReading;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Starts the low-frequency presence monitor for a bed stuck unassigned.
/// At most one monitor per bed; a second request is rejected and the running
/// one is kept.
pub(crate) fn spawn_monitor(agg: Arc<Aggregator>, bed_name: String, reading: SensorReading) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let monitor_id = agg.slots.next_monitor_id();
    let handle = RetryHandle {
        id: monitor_id,
        cancel: cancel_tx,
    };
    if !agg.slots.install_retry(&bed_name, handle) {
        debug!(event = "retry_monitor_exists", bed = %bed_name);
        return;
    }

    info!(
        event = "retry_monitor_start",
        bed = %bed_name,
        esp = %reading.esp_id,
        interval_secs = agg.config.retry_interval.as_secs()
    );
    tokio::spawn(run_monitor(agg, bed_name, reading, cancel_rx, monitor_id));
}

async fn run_monitor(
    agg: Arc<Aggregator>,
    bed_name: String,
    reading: SensorReading,
    mut cancel: watch::Receiver<bool>,
    monitor_id: u64,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(agg.config.retry_interval) => {}
        }
        if *cancel.borrow() {
            break;
        }

        let bed = {
            let store = agg.lock_store();
            store.bed_by_name(&bed_name)
        };
        let bed = match bed {
            Ok(Some(bed)) => bed,
            Ok(None) => {
                info!(event = "retry_monitor_bed_gone", bed = %bed_name);
                break;
            }
            Err(err) => {
                error!(event = "store_error", bed = %bed_name, error = %err);
                continue;
            }
        };
        if bed.room.is_some() {
            // assigned through the batch path while we slept
            debug!(event = "retry_monitor_already_assigned", bed = %bed_name);
            break;
        }

        let present = agg.check_presence(&bed.mac_address).await;
        // the oracle query is a suspension point; a cancellation that raced
        // it must win before any commit
        if *cancel.borrow() {
            break;
        }
        if !present {
            debug!(event = "retry_monitor_still_absent", bed = %bed_name);
            continue;
        }

        // commit only while holding the bed's exclusive slot
        if !agg.slots.try_acquire_worker(&bed_name) {
            continue;
        }
        if *cancel.borrow() {
            agg.slots.release_worker(&bed_name);
            break;
        }

        let outcome = confirm_and_commit(&agg, &bed_name, &reading);
        agg.slots.release_worker(&bed_name);
        match outcome {
            MonitorOutcome::Done => break,
            MonitorOutcome::RetryLater => continue,
        }
    }

    agg.slots.clear_retry(&bed_name, monitor_id);
    info!(event = "retry_monitor_stop", bed = %bed_name);
}

enum MonitorOutcome {
    Done,
    RetryLater,
}

fn confirm_and_commit(
    agg: &Arc<Aggregator>,
    bed_name: &str,
    reading: &SensorReading,
) -> MonitorOutcome {
    // re-read under the slot: the batch path may have moved the bed between
    // our presence check and the claim
    let bed = {
        let store = agg.lock_store();
        store.bed_by_name(bed_name)
    };
    match bed {
        Ok(Some(bed)) if bed.room.is_none() => {}
        Ok(Some(_)) | Ok(None) => return MonitorOutcome::Done,
        Err(err) => {
            error!(event = "store_error", bed = bed_name, error = %err);
            return MonitorOutcome::RetryLater;
        }
    }

    let registration = {
        let store = agg.lock_store();
        store.registration_by_esp(&reading.esp_id)
    };
    match registration {
        Ok(Some(registration)) => {
            worker::commit_assignment(agg, bed_name, &registration.room, reading);
            MonitorOutcome::Done
        }
        Ok(None) => {
            warn!(event = "unregistered_device", bed = bed_name, esp = %reading.esp_id);
            MonitorOutcome::Done
        }
        Err(err) => {
            error!(event = "store_error", bed = bed_name, error = %err);
            MonitorOutcome::RetryLater
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::EngineConfig;
    use crate::dispatch;
    use crate::presence::PresenceOracle;
    use bw_core::{NoticeStatus, ReadingStatus, RoomNotice};
    use bw_storage::BedStore;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Absent for the first `absent_rounds` queries, present afterwards.
    struct EventualOracle {
        absent_rounds: u32,
        queries: AtomicU32,
    }

    impl PresenceOracle for EventualOracle {
        fn is_present<'a>(&'a self, _hardware_addr: &'a str) -> BoxFuture<'a, bool> {
            let round = self.queries.fetch_add(1, Ordering::SeqCst);
            let present = round >= self.absent_rounds;
            Box::pin(async move { present })
        }
    }

    /// Parks mid-query until released, so a cancellation can race it.
    struct SlowOracle {
        release: Arc<tokio::sync::Notify>,
        queried: Arc<AtomicBool>,
    }

    impl PresenceOracle for SlowOracle {
        fn is_present<'a>(&'a self, _hardware_addr: &'a str) -> BoxFuture<'a, bool> {
            let release = self.release.clone();
            let queried = self.queried.clone();
            Box::pin(async move {
                queried.store(true, Ordering::SeqCst);
                release.notified().await;
                true
            })
        }
    }

    fn reading(esp_id: &str, bed_name: &str) -> SensorReading {
        SensorReading {
            esp_id: esp_id.to_string(),
            bed_name: bed_name.to_string(),
            status: ReadingStatus::Sighting,
            rssi: 70,
            link_quality: 2,
            origin_ts: None,
        }
    }

    fn fixture_store() -> BedStore {
        let store = BedStore::open_in_memory().expect("store");
        store
            .insert_bed("aa:bb:cc:dd:ee:01", "B1", None)
            .expect("bed");
        store.insert_registration("E2", "203").expect("reg");
        store
    }

    fn engine(
        store: BedStore,
        oracle: Arc<dyn PresenceOracle>,
    ) -> (Arc<Aggregator>, mpsc::Receiver<RoomNotice>) {
        let (handle, rx) = dispatch::test_handle(8);
        let agg = Arc::new(Aggregator::new(
            EngineConfig {
                retry_interval: Duration::from_millis(20),
                oracle_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
            Arc::new(Mutex::new(store)),
            oracle,
            handle,
        ));
        (agg, rx)
    }

    fn room_of(agg: &Arc<Aggregator>, bed_name: &str) -> Option<String> {
        agg.lock_store()
            .bed_by_name(bed_name)
            .expect("query")
            .expect("bed")
            .room
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_commits_once_the_bed_appears() {
        let oracle = Arc::new(EventualOracle {
            absent_rounds: 2,
            queries: AtomicU32::new(0),
        });
        let (agg, mut rx) = engine(fixture_store(), oracle);

        spawn_monitor(agg.clone(), "B1".to_string(), reading("E2", "B1"));

        let probe = agg.clone();
        wait_until(move || room_of(&probe, "B1").is_some()).await;
        assert_eq!(room_of(&agg, "B1").as_deref(), Some("203"));

        let notice = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notice timeout")
            .expect("notice");
        assert_eq!(notice.room.as_deref(), Some("203"));
        assert_eq!(notice.status, NoticeStatus::Sighting);

        // the monitor deregisters itself after the commit
        let probe = agg.clone();
        wait_until(move || !probe.slots.has_retry("B1")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_monitor_never_commits_after_inflight_query() {
        let release = Arc::new(tokio::sync::Notify::new());
        let queried = Arc::new(AtomicBool::new(false));
        let oracle = Arc::new(SlowOracle {
            release: release.clone(),
            queried: queried.clone(),
        });
        let (agg, mut rx) = engine(fixture_store(), oracle);

        spawn_monitor(agg.clone(), "B1".to_string(), reading("E2", "B1"));

        let probe = queried.clone();
        wait_until(move || probe.load(Ordering::SeqCst)).await;

        // cancel while the oracle query is in flight, then let it finish
        agg.slots.cancel_retry("B1");
        release.notify_one();

        let probe = agg.clone();
        wait_until(move || !probe.slots.has_retry("B1")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(room_of(&agg, "B1").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_monitor_for_same_bed_is_rejected() {
        let oracle = Arc::new(EventualOracle {
            absent_rounds: u32::MAX,
            queries: AtomicU32::new(0),
        });
        let (agg, _rx) = engine(fixture_store(), oracle);

        spawn_monitor(agg.clone(), "B1".to_string(), reading("E2", "B1"));
        assert!(agg.slots.has_retry("B1"));

        // a later unconfirmable batch must reuse the running monitor
        spawn_monitor(agg.clone(), "B1".to_string(), reading("E2", "B1"));
        assert!(agg.slots.has_retry("B1"));

        agg.slots.cancel_retry("B1");
        let probe = agg.clone();
        wait_until(move || !probe.slots.has_retry("B1")).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_stops_without_commit_when_bed_assigned_elsewhere() {
        let oracle = Arc::new(EventualOracle {
            absent_rounds: 1,
            queries: AtomicU32::new(0),
        });
        let (agg, mut rx) = engine(fixture_store(), oracle);

        spawn_monitor(agg.clone(), "B1".to_string(), reading("E2", "B1"));

        // the batch path confirms the bed before the monitor's next round
        agg.lock_store().set_room("B1", Some("104")).expect("seed");

        let probe = agg.clone();
        wait_until(move || !probe.slots.has_retry("B1")).await;

        assert_eq!(room_of(&agg, "B1").as_deref(), Some("104"));
        assert!(rx.try_recv().is_err());
    }
}
