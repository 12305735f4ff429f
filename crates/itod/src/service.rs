//! The tracing service: everything the gRPC surface and the maintenance loop
//! act on, wired together once at startup.

use ito_core::config::ItoConfig;
use ito_core::{now_ms, ItoError, ItoResult, ObservedBeacon};
use ito_storage::ReportBoard;
use ito_sync::{
    purge_expired, spawn_publish, ContactCache, DisclosureTask, ExposureTracker, PublishOutcome,
    RatchetRetirer, SchedulerHandle, SchedulerStatus, StoreBackend, SyncSummary,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::beacon::BeaconSlot;
use crate::metrics::Metrics;

pub struct TracingService {
    pub store: Arc<StoreBackend>,
    pub cache: Arc<ContactCache<StoreBackend>>,
    pub tracker: ExposureTracker<StoreBackend>,
    pub disclosure: Arc<DisclosureTask<StoreBackend>>,
    pub board: ReportBoard,
    pub scheduler: SchedulerHandle,
    pub beacon: BeaconSlot,
    pub metrics: Arc<Metrics>,
    pub flush_interval: Duration,
    pub check_server_interval: Duration,
    pub retention: Duration,
}

impl TracingService {
    /// Intervals come from `config`; the components are built by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ItoConfig,
        store: Arc<StoreBackend>,
        cache: Arc<ContactCache<StoreBackend>>,
        tracker: ExposureTracker<StoreBackend>,
        disclosure: Arc<DisclosureTask<StoreBackend>>,
        board: ReportBoard,
        scheduler: SchedulerHandle,
        beacon: BeaconSlot,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            cache,
            tracker,
            disclosure,
            board,
            scheduler,
            beacon,
            metrics,
            flush_interval: config.cache.flush_interval(),
            check_server_interval: config.exposure.check_server_interval(),
            retention: config.cache.retention(),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            self.scheduler.snapshot().await,
            Ok(snap) if snap.status == SchedulerStatus::Running
        )
    }

    /// Disclose `[from_ms, to_ms]` on a spawned task and wait for the outcome.
    pub async fn publish(&self, from_ms: u64, to_ms: u64) -> ItoResult<PublishOutcome> {
        let retirer: Arc<dyn RatchetRetirer> = Arc::new(self.scheduler.clone());
        let result = spawn_publish(self.disclosure.clone(), from_ms, to_ms, Some(retirer))
            .await
            .map_err(|e| ItoError::Other(anyhow::anyhow!("publish task failed: {e}")))
            .and_then(|r| r);

        let outcome = match &result {
            Ok(PublishOutcome::Published { .. }) => "published",
            Ok(PublishOutcome::NothingToPublish) => "nothing",
            Err(_) => "failed",
        };
        self.metrics.record_publish(outcome);
        result
    }

    /// Returns `(possibly_infected, exposure)`.
    pub fn exposure(&self) -> ItoResult<(bool, Duration)> {
        let (exposure, infected) = self.tracker.evaluate()?;
        Ok((infected, exposure))
    }

    pub fn fetch_checkpoint(&self) -> ItoResult<u64> {
        self.tracker.current_fetch_checkpoint()
    }

    /// Stop advertising, persist whatever the cache holds, start again.
    pub async fn restart(&self) -> ItoResult<bool> {
        self.scheduler.stop().await?;
        self.flush();
        self.scheduler.start().await?;
        info!("tracing restarted");
        Ok(self.is_running().await)
    }

    /// Feed one scan result into the contact cache. `observed_at == 0` means now.
    pub fn submit_observation(&self, payload: &[u8], rssi: i32, observed_at: u64) -> &'static str {
        let rssi = rssi.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8;
        let observed_at = if observed_at == 0 { now_ms() } else { observed_at };

        let outcome = match ObservedBeacon::from_payload(payload, rssi, observed_at) {
            Some(beacon) => self.cache.ingest(beacon).as_str(),
            None => {
                debug!(len = payload.len(), "scan payload is not a TCN beacon, dropped");
                "dropped"
            }
        };
        self.metrics.record_ingest(outcome);
        self.metrics.open_sessions.set(self.cache.open_sessions() as i64);
        outcome
    }

    pub fn current_beacon(&self) -> Option<Vec<u8>> {
        self.beacon.current()
    }

    /// Persist sessions; errors are logged and retried on the next pass.
    pub fn flush(&self) -> usize {
        let flushed = match self.cache.flush() {
            Ok(n) => n,
            Err(e) => {
                warn!("contact cache flush failed: {e}");
                0
            }
        };
        self.metrics.sessions_flushed.inc_by(flushed as u64);
        self.metrics.open_sessions.set(self.cache.open_sessions() as i64);
        flushed
    }

    pub async fn sync_reports(&self) -> ItoResult<SyncSummary> {
        let summary = self.tracker.sync_from(&self.board).await?;
        self.metrics.reports_fetched.inc_by(summary.stored as u64);
        Ok(summary)
    }

    fn purge(&self) {
        if let Err(e) = purge_expired(&*self.store, now_ms(), self.retention) {
            warn!("retention purge failed: {e}");
        }
    }

    /// Flush on `flush_interval`, then sync reports and purge on
    /// `check_server_interval`, until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut flush_tick = tokio::time::interval(self.flush_interval);
        let mut check_tick = tokio::time::interval(self.check_server_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            flush_secs = self.flush_interval.as_secs(),
            check_secs = self.check_server_interval.as_secs(),
            "maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = flush_tick.tick() => {
                    self.flush();
                }
                _ = check_tick.tick() => {
                    match self.sync_reports().await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => warn!("report sync failed, will retry: {e}"),
                        Err(e) => warn!("report sync failed: {e}"),
                    }
                    self.purge();
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("maintenance loop stopped");
    }

    /// Stop advertising and persist the cache.
    pub async fn shutdown(&self) {
        if let Err(e) = self.scheduler.stop().await {
            warn!("scheduler stop on shutdown: {e}");
        }
        let flushed = self.flush();
        info!(flushed, "tracing service stopped");
    }
}
