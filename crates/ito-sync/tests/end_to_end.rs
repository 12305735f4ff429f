//! Integration test: one device advertises and later discloses, another
//! device records the contact and detects the exposure through the report
//! index. Uses OpenDAL's in-memory backend so no live S3 is required.

use ito_core::{ObservedBeacon, Tcn};
use ito_crypto::{RatchetState, Report};
use ito_storage::{build_memory_operator, ReportBoard};
use ito_sync::{
    CacheConfig, ContactCache, DisclosureConfig, DisclosureTask, ExposureConfig, ExposureTracker,
    MemoryStore, PublishOutcome, RecordStore, StoredRecord,
};
use std::sync::Arc;
use std::time::Duration;

const T0: u64 = 1_700_000_000_000;

#[test]
fn report_expands_to_exactly_the_advertised_tcns() {
    let mut ratchet = RatchetState::new(96);
    let advertised: Vec<Tcn> = (0..3).map(|_| ratchet.tick().unwrap()).collect();

    let report = ratchet.report_for_range(0, 2, 96, vec![]).unwrap();
    let decoded = Report::decode(&report.encode()).unwrap();
    let expanded: Vec<Tcn> = decoded.tcns().collect();

    assert_eq!(expanded, advertised);
}

#[tokio::test]
async fn nine_hundred_seconds_of_contact_crosses_six_hundred_second_threshold() {
    let board = ReportBoard::new(build_memory_operator().unwrap(), "ito");

    // Device A: ticks three times, then discloses
    let store_a = Arc::new(MemoryStore::new());
    let mut ratchet = RatchetState::new(96);
    let tcns: Vec<Tcn> = (0..3).map(|_| ratchet.tick().unwrap()).collect();
    store_a
        .upsert(
            &ito_sync::store::ratchet_key(ratchet.id()),
            &StoredRecord::Ratchet(ratchet),
        )
        .unwrap();

    // Device B: saw TCN1 for 900 seconds
    let store_b = Arc::new(MemoryStore::new());
    let cache = Arc::new(ContactCache::new(store_b.clone(), CacheConfig::default()));
    for offset_s in (0..=900).step_by(60) {
        let at = T0 + offset_s * 1000;
        cache.ingest_at(ObservedBeacon::new(tcns[1], -65, at), at);
    }
    let tracker = ExposureTracker::new(
        store_b.clone(),
        cache.clone(),
        ExposureConfig {
            min_exposure_duration: Duration::from_secs(600),
        },
    );
    assert!(!tracker.is_possibly_infected().unwrap(), "no reports yet");

    // A publishes everything it has
    let disclosure = DisclosureTask::new(
        store_a.clone(),
        Arc::new(board.clone()),
        DisclosureConfig {
            tcn_valid_interval: Duration::from_secs(900),
            max_report_span: 96,
            memo: b"positive".to_vec(),
        },
    );
    let outcome = disclosure.publish(0, u64::MAX, None).await.unwrap();
    assert!(matches!(
        outcome,
        PublishOutcome::Published {
            reports: 1,
            purged: true,
            ..
        }
    ));
    assert!(store_a.ratchets().unwrap().is_empty());

    // B syncs and evaluates
    let summary = tracker.sync_from(&board).await.unwrap();
    assert_eq!(summary.stored, 1);
    assert_eq!(
        tracker.current_fetch_checkpoint().unwrap(),
        summary.checkpoint
    );

    let report = &tracker.known_reports().unwrap()[0];
    assert_eq!(report.memo, b"positive");
    assert_eq!(
        cache.check_exposure(report).unwrap(),
        Duration::from_secs(900)
    );
    assert!(tracker.is_possibly_infected().unwrap());

    // Still true once the session has been flushed to the store
    cache.flush_at(T0 + 3_600_000).unwrap();
    assert_eq!(cache.open_sessions(), 0);
    assert!(tracker.is_possibly_infected().unwrap());
}
