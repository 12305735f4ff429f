//! Integration test: ratchet material is deleted only after a confirmed publish.

use async_trait::async_trait;
use ito_core::{ItoError, ItoResult};
use ito_crypto::RatchetState;
use ito_sync::store::ratchet_key;
use ito_sync::{
    spawn_publish, Advertiser, BeaconScheduler, DisclosureConfig, DisclosureTask, MemoryStore,
    PublishOutcome, RatchetRetirer, RecordStore, ReportPublisher, SchedulerConfig, StoredRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct FailingPublisher;

#[async_trait]
impl ReportPublisher for FailingPublisher {
    async fn publish(&self, _reports: &[Vec<u8>]) -> ItoResult<()> {
        Err(ItoError::PublishFailed("503 service unavailable".into()))
    }
}

#[derive(Default)]
struct CountingPublisher {
    delivered: AtomicUsize,
}

#[async_trait]
impl ReportPublisher for CountingPublisher {
    async fn publish(&self, reports: &[Vec<u8>]) -> ItoResult<()> {
        self.delivered.fetch_add(reports.len(), Ordering::SeqCst);
        Ok(())
    }
}

/// Memory store whose deletes always fail.
#[derive(Default)]
struct NoDeleteStore {
    inner: MemoryStore,
}

impl RecordStore for NoDeleteStore {
    fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()> {
        self.inner.upsert(key, record)
    }
    fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>> {
        self.inner.get(key)
    }
    fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>> {
        self.inner.scan_prefix(prefix)
    }
    fn delete_where(
        &self,
        _prefix: &str,
        _pred: &dyn Fn(&str, &StoredRecord) -> bool,
    ) -> ItoResult<usize> {
        Err(ItoError::store("database is locked"))
    }
}

fn config() -> DisclosureConfig {
    DisclosureConfig {
        tcn_valid_interval: Duration::from_secs(900),
        max_report_span: 96,
        memo: vec![],
    }
}

fn seed_ratchet<S: RecordStore>(store: &S, ticks: u32) -> String {
    let mut ratchet = RatchetState::new(96);
    for _ in 0..ticks {
        ratchet.tick().unwrap();
    }
    let id = ratchet.id().to_string();
    store
        .upsert(&ratchet_key(&id), &StoredRecord::Ratchet(ratchet))
        .unwrap();
    id
}

#[tokio::test]
async fn failed_publish_retains_material() {
    let store = Arc::new(MemoryStore::new());
    let id = seed_ratchet(&*store, 3);
    let task = DisclosureTask::new(store.clone(), Arc::new(FailingPublisher), config());

    let err = task.publish(0, u64::MAX, None).await.unwrap_err();
    assert!(matches!(err, ItoError::PublishFailed(_)));
    assert!(store.get(&ratchet_key(&id)).unwrap().is_some());

    // The user can retry once the server is back
    let publisher = Arc::new(CountingPublisher::default());
    let retry = DisclosureTask::new(store.clone(), publisher.clone(), config());
    let outcome = retry.publish(0, u64::MAX, None).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { purged: true, .. }));
    assert_eq!(publisher.delivered.load(Ordering::SeqCst), 1);
    assert!(store.get(&ratchet_key(&id)).unwrap().is_none());
}

#[tokio::test]
async fn successful_publish_removes_material() {
    let store = Arc::new(MemoryStore::new());
    let a = seed_ratchet(&*store, 2);
    let b = seed_ratchet(&*store, 5);
    // Never ticked: nothing to disclose, kept
    let idle = seed_ratchet(&*store, 0);

    let task = Arc::new(DisclosureTask::new(
        store.clone(),
        Arc::new(CountingPublisher::default()),
        config(),
    ));
    let outcome = spawn_publish(task, 0, u64::MAX, None)
        .await
        .unwrap()
        .unwrap();

    match outcome {
        PublishOutcome::Published {
            reports,
            mut ratchets,
            retained,
            purged,
        } => {
            assert_eq!(reports, 2);
            ratchets.sort();
            let mut expected = vec![a.clone(), b.clone()];
            expected.sort();
            assert_eq!(ratchets, expected);
            assert!(retained.is_empty());
            assert!(purged);
        }
        other => panic!("expected Published, got {other:?}"),
    }
    let remaining: Vec<String> = store
        .ratchets()
        .unwrap()
        .iter()
        .map(|r| r.id().to_string())
        .collect();
    assert_eq!(remaining, vec![idle]);
}

#[tokio::test]
async fn store_unavailable_during_delete_keeps_material() {
    let store = Arc::new(NoDeleteStore::default());
    let id = seed_ratchet(&*store, 2);
    let task = DisclosureTask::new(store.clone(), Arc::new(CountingPublisher::default()), config());

    let outcome = task.publish(0, u64::MAX, None).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { purged: false, .. }));
    assert!(store.get(&ratchet_key(&id)).unwrap().is_some());
}

#[tokio::test]
async fn empty_window_publishes_nothing() {
    let store = Arc::new(MemoryStore::new());
    seed_ratchet(&*store, 2);
    let publisher = Arc::new(CountingPublisher::default());
    let task = DisclosureTask::new(store.clone(), publisher.clone(), config());

    let outcome = task.publish(0, 1, None).await.unwrap();
    assert_eq!(outcome, PublishOutcome::NothingToPublish);
    assert_eq!(publisher.delivered.load(Ordering::SeqCst), 0);
    assert_eq!(store.ratchets().unwrap().len(), 1);
}

#[tokio::test]
async fn ticks_outside_window_keep_ratchet_until_disclosed() {
    const DAY: u64 = 86_400_000;
    let store = Arc::new(MemoryStore::new());
    // Two ticks, stopped for a day, resumed for three more
    let mut ratchet = RatchetState::new(96);
    for at in [0, 900_000, DAY, DAY + 900_000, DAY + 1_800_000] {
        ratchet.tick_at(at).unwrap();
    }
    let id = ratchet.id().to_string();
    store
        .upsert(&ratchet_key(&id), &StoredRecord::Ratchet(ratchet))
        .unwrap();

    let publisher = Arc::new(CountingPublisher::default());
    let task = DisclosureTask::new(store.clone(), publisher.clone(), config());

    let outcome = task.publish(DAY, DAY + 3_600_000, None).await.unwrap();
    let PublishOutcome::Published { retained, purged, .. } = outcome else {
        panic!("expected Published, got {outcome:?}");
    };
    assert_eq!(retained, vec![id.clone()]);
    assert!(purged);
    let Some(StoredRecord::Ratchet(kept)) = store.get(&ratchet_key(&id)).unwrap() else {
        panic!("partly disclosed ratchet was deleted");
    };
    assert!(kept.is_retired());

    // Disclosing the earlier day too releases the material
    let outcome = task.publish(0, u64::MAX, None).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { purged: true, .. }));
    assert!(store.get(&ratchet_key(&id)).unwrap().is_none());
    assert_eq!(publisher.delivered.load(Ordering::SeqCst), 2);
}

struct NullAdvertiser;

impl Advertiser for NullAdvertiser {
    fn advertise(&mut self, _payload: &[u8]) -> ItoResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn live_ratchet_is_retired_before_deletion() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = BeaconScheduler::new(
        store.clone(),
        NullAdvertiser,
        SchedulerConfig {
            tcn_valid_interval: Duration::from_secs(900),
            exchange_interval: 96,
            tx_power_calibration: None,
            persist_retries: 0,
            persist_backoff: Duration::from_millis(1),
        },
    );
    let (handle, _task) = scheduler.spawn();
    handle.start().await.unwrap();
    let live = handle.snapshot().await.unwrap().ratchet_id.unwrap();

    let task = DisclosureTask::new(store.clone(), Arc::new(CountingPublisher::default()), config());
    let retirer: &dyn RatchetRetirer = &handle;
    let outcome = task.publish(0, u64::MAX, Some(retirer)).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { purged: true, .. }));

    // The scheduler moved on to a fresh chain; the disclosed one is gone
    let now_live = handle.snapshot().await.unwrap().ratchet_id.unwrap();
    assert_ne!(now_live, live);
    assert!(store.get(&ratchet_key(&live)).unwrap().is_none());
    assert!(store.get(&ratchet_key(&now_live)).unwrap().is_some());

    handle.shutdown().await;
}
