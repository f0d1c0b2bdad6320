use crate::aggregator::Aggregator;
use crate::buffer::PendingReading;
use crate::retry;
use bw_core::{NoticeStatus, RoomNotice, SensorReading};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Two-stage leader election over one bed's batch: per reporting device keep
/// the strongest sighting, then pick the strongest across device winners.
/// Ties fall to the earliest receipt; batch order is the final tie-break, so
/// repeated runs over the same batch always agree.
pub(crate) fn elect_winner(batch: &[PendingReading]) -> Option<&PendingReading> {
    let mut device_best: Vec<(&str, &PendingReading)> = Vec::new();
    for pending in batch {
        if pending.reading.is_departure() {
            continue;
        }
        match device_best
            .iter_mut()
            .find(|(esp_id, _)| *esp_id == pending.reading.esp_id)
        {
            Some((_, best)) => {
                if beats(pending, best) {
                    *best = pending;
                }
            }
            None => device_best.push((pending.reading.esp_id.as_str(), pending)),
        }
    }

    let mut winner: Option<&PendingReading> = None;
    for (_, candidate) in device_best {
        match winner {
            None => winner = Some(candidate),
            Some(best) if beats(candidate, best) => winner = Some(candidate),
            Some(_) => {}
        }
    }
    winner
}

fn beats(challenger: &PendingReading, incumbent: &PendingReading) -> bool {
    challenger.reading.rssi > incumbent.reading.rssi
        || (challenger.reading.rssi == incumbent.reading.rssi
            && challenger.received_at < incumbent.received_at)
}

/// Runs one debounce cycle for one bed. The caller holds the bed's worker
/// slot for the whole call.
pub(crate) async fn process_batch(
    agg: &Arc<Aggregator>,
    bed_name: &str,
    batch: Vec<PendingReading>,
) {
    if let Some(departure) = batch
        .iter()
        .filter(|pending| pending.reading.is_departure())
        .last()
    {
        // departure is authoritative; concurrent sightings in the batch are
        // discarded and any pending retry monitor is cancelled
        agg.slots.cancel_retry(bed_name);
        handle_departure(agg, bed_name, &departure.reading);
        return;
    }

    let Some(winner) = elect_winner(&batch) else {
        return;
    };
    let reading = winner.reading.clone();

    let (bed, registration) = {
        let store = agg.lock_store();
        let bed = store.bed_by_name(bed_name);
        let registration = store.registration_by_esp(&reading.esp_id);
        (bed, registration)
    };

    let bed = match bed {
        Ok(Some(bed)) => bed,
        Ok(None) => {
            warn!(event = "unregistered_bed", bed = bed_name, esp = %reading.esp_id);
            return;
        }
        Err(err) => {
            error!(event = "store_error", bed = bed_name, error = %err);
            return;
        }
    };
    let registration = match registration {
        Ok(Some(registration)) => registration,
        Ok(None) => {
            warn!(event = "unregistered_device", bed = bed_name, esp = %reading.esp_id);
            return;
        }
        Err(err) => {
            error!(event = "store_error", bed = bed_name, error = %err);
            return;
        }
    };

    let present = agg.check_presence(&bed.mac_address).await;
    match (present, bed.room.as_deref()) {
        (true, None) => {
            commit_assignment(agg, bed_name, &registration.room, &reading);
        }
        (true, Some(room)) if room == registration.room => {
            info!(event = "assignment_confirmed", bed = bed_name, room);
        }
        (true, Some(room)) => {
            // existing assignment wins until an explicit departure
            warn!(
                event = "assignment_conflict",
                bed = bed_name,
                current = room,
                implied = %registration.room,
                esp = %reading.esp_id
            );
        }
        (false, Some(room)) => {
            debug!(
                event = "offline_sighting_ignored",
                bed = bed_name,
                room,
                esp = %reading.esp_id
            );
        }
        (false, None) => {
            retry::spawn_monitor(agg.clone(), bed_name.to_string(), reading);
        }
    }
}

fn handle_departure(agg: &Arc<Aggregator>, bed_name: &str, reading: &SensorReading) {
    let prior_room = {
        let store = agg.lock_store();
        match store.bed_by_name(bed_name) {
            Ok(Some(bed)) => match bed.room {
                Some(room) => {
                    if let Err(err) = store.set_room(bed_name, None) {
                        error!(event = "commit_failed", bed = bed_name, error = %err);
                        return;
                    }
                    room
                }
                None => {
                    debug!(event = "departure_noop", bed = bed_name);
                    return;
                }
            },
            Ok(None) => {
                warn!(event = "unregistered_bed", bed = bed_name);
                return;
            }
            Err(err) => {
                error!(event = "store_error", bed = bed_name, error = %err);
                return;
            }
        }
    };

    info!(event = "bed_departed", bed = bed_name, prior_room = %prior_room);
    agg.dispatch.enqueue(RoomNotice {
        room: None,
        bed_name: bed_name.to_string(),
        status: NoticeStatus::Departed,
        origin_ts: reading.origin_ts,
        link_quality: reading.link_quality,
    });
}

/// Commits `room` for the bed and queues the sighting notice. Shared by the
/// batch path and the retry monitor; the caller holds the bed's worker slot.
pub(crate) fn commit_assignment(
    agg: &Arc<Aggregator>,
    bed_name: &str,
    room: &str,
    reading: &SensorReading,
) -> bool {
    {
        let store = agg.lock_store();
        match store.set_room(bed_name, Some(room)) {
            Ok(true) => {}
            Ok(false) => {
                warn!(event = "bed_vanished_before_commit", bed = bed_name);
                return false;
            }
            Err(err) => {
                error!(event = "commit_failed", bed = bed_name, error = %err);
                return false;
            }
        }
    }

    info!(event = "bed_assigned", bed = bed_name, room, esp = %reading.esp_id);
    agg.dispatch.enqueue(RoomNotice {
        room: Some(room.to_string()),
        bed_name: bed_name.to_string(),
        status: NoticeStatus::Sighting,
        origin_ts: reading.origin_ts,
        link_quality: reading.link_quality,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::EngineConfig;
    use crate::buffer::RetryHandle;
    use crate::dispatch;
    use crate::presence::PresenceOracle;
    use bw_core::ReadingStatus;
    use bw_storage::BedStore;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::sync::{mpsc, watch};

    struct FixedOracle(bool);

    impl PresenceOracle for FixedOracle {
        fn is_present<'a>(&'a self, _hardware_addr: &'a str) -> BoxFuture<'a, bool> {
            let present = self.0;
            Box::pin(async move { present })
        }
    }

    fn pending(esp_id: &str, bed_name: &str, status: ReadingStatus, rssi: i32) -> PendingReading {
        PendingReading {
            reading: SensorReading {
                esp_id: esp_id.to_string(),
                bed_name: bed_name.to_string(),
                status,
                rssi,
                link_quality: 2,
                origin_ts: None,
            },
            received_at: Instant::now(),
        }
    }

    fn sighting(esp_id: &str, bed_name: &str, rssi: i32) -> PendingReading {
        pending(esp_id, bed_name, ReadingStatus::Sighting, rssi)
    }

    fn fixture_store() -> BedStore {
        let store = BedStore::open_in_memory().expect("store");
        store
            .insert_bed("aa:bb:cc:dd:ee:01", "B1", None)
            .expect("bed");
        store.insert_registration("E1", "104").expect("reg E1");
        store.insert_registration("E2", "203").expect("reg E2");
        store.insert_registration("E3", "104").expect("reg E3");
        store
    }

    fn engine(
        store: BedStore,
        present: bool,
    ) -> (Arc<Aggregator>, mpsc::Receiver<RoomNotice>) {
        let (handle, rx) = dispatch::test_handle(8);
        let agg = Arc::new(Aggregator::new(
            EngineConfig {
                retry_interval: Duration::from_millis(20),
                ..EngineConfig::default()
            },
            Arc::new(Mutex::new(store)),
            Arc::new(FixedOracle(present)),
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

    #[test]
    fn arbitration_prefers_strongest_signal() {
        let batch = vec![
            sighting("E1", "B1", 40),
            sighting("E2", "B1", 70),
            sighting("E2", "B1", 55),
        ];
        let winner = elect_winner(&batch).expect("winner");
        assert_eq!(winner.reading.esp_id, "E2");
        assert_eq!(winner.reading.rssi, 70);
    }

    #[test]
    fn arbitration_breaks_signal_ties_by_earliest_receipt() {
        let mut early = sighting("E1", "B1", 60);
        early.received_at = Instant::now() - Duration::from_secs(5);
        let late = sighting("E2", "B1", 60);

        let binding = [late.clone(), early.clone()];
        let winner = elect_winner(&binding).expect("winner");
        assert_eq!(winner.reading.esp_id, "E1");
    }

    #[test]
    fn arbitration_is_deterministic_across_runs() {
        let batch = vec![
            sighting("E1", "B1", 40),
            sighting("E2", "B1", 70),
            sighting("E3", "B1", 70),
            sighting("E1", "B1", 65),
        ];
        let first = elect_winner(&batch).expect("winner").reading.clone();
        for _ in 0..10 {
            let winner = elect_winner(&batch).expect("winner");
            assert_eq!(winner.reading, first);
        }
    }

    #[test]
    fn arbitration_ignores_departures() {
        let batch = vec![pending("E1", "B1", ReadingStatus::Departed, 0)];
        assert!(elect_winner(&batch).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn confirmed_sighting_commits_and_dispatches() {
        let (agg, mut rx) = engine(fixture_store(), true);
        let batch = vec![sighting("E1", "B1", 40), sighting("E2", "B1", 70)];

        process_batch(&agg, "B1", batch).await;

        assert_eq!(room_of(&agg, "B1").as_deref(), Some("203"));
        let notice = rx.try_recv().expect("notice");
        assert_eq!(notice.bed_name, "B1");
        assert_eq!(notice.room.as_deref(), Some("203"));
        assert_eq!(notice.status, NoticeStatus::Sighting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconfirmation_of_same_room_is_silent() {
        let store = fixture_store();
        store.set_room("B1", Some("203")).expect("seed");
        let (agg, mut rx) = engine(store, true);

        process_batch(&agg, "B1", vec![sighting("E2", "B1", 70)]).await;

        assert_eq!(room_of(&agg, "B1").as_deref(), Some("203"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conflicting_sighting_never_evicts_assignment() {
        let store = fixture_store();
        store.set_room("B1", Some("203")).expect("seed");
        let (agg, mut rx) = engine(store, true);

        // E3 implies room 104 while B1 sits confirmed in 203
        process_batch(&agg, "B1", vec![sighting("E3", "B1", 90)]).await;

        assert_eq!(room_of(&agg, "B1").as_deref(), Some("203"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offline_sighting_of_assigned_bed_is_ignored() {
        let store = fixture_store();
        store.set_room("B1", Some("203")).expect("seed");
        let (agg, mut rx) = engine(store, false);

        process_batch(&agg, "B1", vec![sighting("E2", "B1", 70)]).await;

        assert_eq!(room_of(&agg, "B1").as_deref(), Some("203"));
        assert!(rx.try_recv().is_err());
        assert!(!agg.slots.has_retry("B1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unconfirmable_sighting_hands_off_to_retry_monitor() {
        let (agg, mut rx) = engine(fixture_store(), false);

        process_batch(&agg, "B1", vec![sighting("E2", "B1", 70)]).await;

        assert!(room_of(&agg, "B1").is_none());
        assert!(rx.try_recv().is_err());
        assert!(agg.slots.has_retry("B1"));

        agg.slots.cancel_retry("B1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn departure_clears_room_and_cancels_retry() {
        let store = fixture_store();
        store.set_room("B1", Some("203")).expect("seed");
        let (agg, mut rx) = engine(store, true);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        assert!(agg.slots.install_retry(
            "B1",
            RetryHandle {
                id: 7,
                cancel: cancel_tx,
            }
        ));

        let batch = vec![
            sighting("E2", "B1", 70),
            pending("E1", "B1", ReadingStatus::Departed, 0),
        ];
        process_batch(&agg, "B1", batch).await;

        assert!(room_of(&agg, "B1").is_none());
        assert!(*cancel_rx.borrow());
        assert!(!agg.slots.has_retry("B1"));

        let notice = rx.try_recv().expect("notice");
        assert_eq!(notice.status, NoticeStatus::Departed);
        assert!(notice.room.is_none());
        // the concurrent sighting was discarded, not acted on
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn departure_of_unassigned_bed_is_a_noop() {
        let (agg, mut rx) = engine(fixture_store(), true);

        process_batch(
            &agg,
            "B1",
            vec![pending("E1", "B1", ReadingStatus::Departed, 0)],
        )
        .await;

        assert!(room_of(&agg, "B1").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregistered_device_discards_batch() {
        let (agg, mut rx) = engine(fixture_store(), true);

        process_batch(&agg, "B1", vec![sighting("E9", "B1", 70)]).await;

        assert!(room_of(&agg, "B1").is_none());
        assert!(rx.try_recv().is_err());
        assert!(!agg.slots.has_retry("B1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_bed_discards_batch() {
        let (agg, mut rx) = engine(fixture_store(), true);

        process_batch(&agg, "B9", vec![sighting("E2", "B9", 70)]).await;

        assert!(rx.try_recv().is_err());
        assert!(!agg.slots.has_retry("B9"));
    }
}
