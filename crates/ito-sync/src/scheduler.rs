//! Beacon scheduler: ticks the ratchet every `tcn_valid_interval`, hands each
//! TCN to the advertiser and persists the ratchet after every tick.
//!
//! The scheduler owns its `RatchetState` outright. When spawned it runs as a
//! single tokio task driven by a command channel, so ticks, starts, stops and
//! retirements never overlap.

use async_trait::async_trait;
use ito_core::config::{RatchetConfig, StoreConfig};
use ito_core::{ItoError, ItoResult, Tcn};
use ito_crypto::RatchetState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::publish::RatchetRetirer;
use crate::store::{ratchet_key, RecordStore, StoredRecord};

/// The platform's broadcast side.
pub trait Advertiser: Send + 'static {
    /// Replace the advertised payload.
    fn advertise(&mut self, payload: &[u8]) -> ItoResult<()>;

    /// Stop broadcasting.
    fn halt(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tcn_valid_interval: Duration,
    /// Ticks per ratchet
    pub exchange_interval: u32,
    /// Trailing calibration byte, if any
    pub tx_power_calibration: Option<i8>,
    pub persist_retries: u32,
    /// First retry delay; doubled on every further attempt
    pub persist_backoff: Duration,
}

impl SchedulerConfig {
    pub fn from_config(ratchet: &RatchetConfig, store: &StoreConfig) -> Self {
        Self {
            tcn_valid_interval: ratchet.tcn_valid_interval(),
            exchange_interval: ratchet.exchange_interval,
            tx_power_calibration: ratchet.tx_power_calibration,
            persist_retries: store.persist_retries,
            persist_backoff: Duration::from_millis(store.persist_backoff_ms),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&RatchetConfig::default(), &StoreConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Stopped,
    Running,
}

/// Counters shared with whoever exports metrics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    tcns_generated: AtomicU64,
    persist_failures: AtomicU64,
    rotations: AtomicU64,
}

impl SchedulerStats {
    pub fn tcns_generated(&self) -> u64 {
        self.tcns_generated.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub status: SchedulerStatus,
    pub ratchet_id: Option<String>,
    /// Ticks generated by the current ratchet
    pub tick_index: Option<u32>,
    pub tcns_generated: u64,
    pub persist_failures: u64,
}

pub struct BeaconScheduler<S, A> {
    store: Arc<S>,
    advertiser: A,
    config: SchedulerConfig,
    ratchet: Option<RatchetState>,
    status: SchedulerStatus,
    next_tick: Option<Instant>,
    stats: Arc<SchedulerStats>,
}

impl<S: RecordStore, A: Advertiser> BeaconScheduler<S, A> {
    pub fn new(store: Arc<S>, advertiser: A, config: SchedulerConfig) -> Self {
        Self {
            store,
            advertiser,
            config,
            ratchet: None,
            status: SchedulerStatus::Stopped,
            next_tick: None,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
    }

    pub fn advertiser(&self) -> &A {
        &self.advertiser
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            status: self.status,
            ratchet_id: self.ratchet.as_ref().map(|r| r.id().to_string()),
            tick_index: self.ratchet.as_ref().map(|r| r.tick_index()),
            tcns_generated: self.stats.tcns_generated(),
            persist_failures: self.stats.persist_failures(),
        }
    }

    /// Begin advertising. Resumes the most recent live persisted ratchet, if
    /// any, continuing from its stored tick index.
    pub async fn start(&mut self) -> ItoResult<()> {
        if self.status == SchedulerStatus::Running {
            return Ok(());
        }
        if self.ratchet.as_ref().map_or(true, |r| r.is_exhausted()) {
            self.ratchet = Some(self.resume_or_create());
        }
        self.status = SchedulerStatus::Running;
        info!("beacon scheduler started");

        self.on_tick().await?;
        self.next_tick = Some(Instant::now() + self.config.tcn_valid_interval);
        Ok(())
    }

    /// Stop advertising. The current ratchet is kept (and already persisted),
    /// so a later `start` continues the same chain.
    pub fn stop(&mut self) {
        if self.status == SchedulerStatus::Stopped {
            return;
        }
        self.status = SchedulerStatus::Stopped;
        self.next_tick = None;
        self.advertiser.halt();
        info!(
            ratchet_id = self.ratchet.as_ref().map(|r| r.id()),
            "beacon scheduler stopped"
        );
    }

    fn resume_or_create(&self) -> RatchetState {
        match self.store.ratchets() {
            Ok(ratchets) => {
                if let Some(ratchet) = ratchets
                    .into_iter()
                    .filter(|r| !r.is_exhausted())
                    .max_by_key(|r| r.created_at())
                {
                    info!(
                        ratchet_id = ratchet.id(),
                        tick = ratchet.tick_index(),
                        "resuming persisted ratchet"
                    );
                    return ratchet;
                }
            }
            Err(e) => warn!("could not load persisted ratchets, starting fresh: {e}"),
        }
        self.fresh_ratchet()
    }

    fn fresh_ratchet(&self) -> RatchetState {
        let ratchet = RatchetState::new(self.config.exchange_interval);
        info!(ratchet_id = ratchet.id(), "new ratchet created");
        ratchet
    }

    /// One scheduled tick: rotate if exhausted, derive the next TCN,
    /// advertise it, persist the ratchet.
    pub async fn on_tick(&mut self) -> ItoResult<Tcn> {
        let mut ratchet = match self.ratchet.take() {
            Some(r) if !r.is_exhausted() => r,
            Some(r) => {
                info!(ratchet_id = r.id(), "ratchet exhausted, rotating");
                self.stats.rotations.fetch_add(1, Ordering::Relaxed);
                self.fresh_ratchet()
            }
            None => self.fresh_ratchet(),
        };

        let tcn = match ratchet.tick() {
            Ok(tcn) => tcn,
            Err(e) => {
                self.ratchet = Some(ratchet);
                return Err(e);
            }
        };
        self.stats.tcns_generated.fetch_add(1, Ordering::Relaxed);

        let mut payload = tcn.as_bytes().to_vec();
        if let Some(tx_power) = self.config.tx_power_calibration {
            payload.extend_from_slice(&tx_power.to_be_bytes());
        }
        debug!(
            ratchet_id = ratchet.id(),
            tick = ratchet.tick_index() - 1,
            tcn = %tcn,
            "advertising TCN"
        );
        if let Err(e) = self.advertiser.advertise(&payload) {
            warn!("advertiser rejected payload: {e}");
        }

        persist_with_retry(&*self.store, &self.stats, &self.config, &ratchet).await;
        self.ratchet = Some(ratchet);
        Ok(tcn)
    }

    /// Permanently stop the named ratchets. If the live ratchet is among them
    /// and the scheduler is running, a fresh ratchet takes over immediately.
    pub async fn retire(&mut self, ids: &[String]) -> ItoResult<()> {
        let mut rekey = false;

        for id in ids {
            let is_current = self.ratchet.as_ref().is_some_and(|r| r.id() == id);
            let state = if is_current {
                rekey = true;
                self.ratchet.take()
            } else {
                match self.store.get(&ratchet_key(id))? {
                    Some(StoredRecord::Ratchet(state)) => Some(state),
                    _ => None,
                }
            };

            if let Some(mut state) = state {
                if !state.is_retired() {
                    state.retire();
                    self.store
                        .upsert(&ratchet_key(id), &StoredRecord::Ratchet(state))?;
                    info!(ratchet_id = %id, current = is_current, "ratchet retired");
                }
            }
        }

        if rekey && self.status == SchedulerStatus::Running {
            self.on_tick().await?;
            self.next_tick = Some(Instant::now() + self.config.tcn_valid_interval);
        }
        Ok(())
    }

    /// Run the scheduler on its own task.
    pub fn spawn(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(self.run(rx));
        (SchedulerHandle { tx }, handle)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.next_tick;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd).await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.on_tick().await {
                        warn!("scheduled tick failed: {e}");
                    }
                    self.next_tick = Some(Instant::now() + self.config.tcn_valid_interval);
                }
            }
        }
        self.stop();
        info!("beacon scheduler shut down");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Retire(ids, reply) => {
                let _ = reply.send(self.retire(&ids).await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }
}

/// Best-effort write with doubling backoff. The in-memory chain has already
/// advanced; a lost write only costs reportability of this tick after a
/// restart.
async fn persist_with_retry<S: RecordStore>(
    store: &S,
    stats: &SchedulerStats,
    config: &SchedulerConfig,
    ratchet: &RatchetState,
) -> bool {
    let key = ratchet_key(ratchet.id());
    let record = StoredRecord::Ratchet(ratchet.clone());
    let mut backoff = config.persist_backoff;

    for attempt in 0..=config.persist_retries {
        match store.upsert(&key, &record) {
            Ok(()) => return true,
            Err(e) if attempt < config.persist_retries => {
                debug!(attempt, "ratchet persist failed, retrying: {e}");
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    ratchet_id = ratchet.id(),
                    tick = ratchet.tick_index(),
                    "ratchet state not persisted, latest tick may not be reportable after restart: {e}"
                );
            }
        }
    }
    false
}

enum Command {
    Start(oneshot::Sender<ItoResult<()>>),
    Stop(oneshot::Sender<()>),
    Retire(Vec<String>, oneshot::Sender<ItoResult<()>>),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown,
}

/// Control handle for a spawned scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ItoResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    pub async fn start(&self) -> ItoResult<()> {
        self.request(Command::Start).await?
    }

    pub async fn stop(&self) -> ItoResult<()> {
        self.request(Command::Stop).await
    }

    pub async fn snapshot(&self) -> ItoResult<SchedulerSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

#[async_trait]
impl RatchetRetirer for SchedulerHandle {
    async fn retire(&self, ids: &[String]) -> ItoResult<()> {
        let ids = ids.to_vec();
        self.request(|reply| Command::Retire(ids, reply)).await?
    }
}

fn gone() -> ItoError {
    ItoError::Other(anyhow::anyhow!("beacon scheduler has shut down"))
}
