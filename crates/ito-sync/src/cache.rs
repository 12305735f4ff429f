//! Contact cache: aggregates scanned beacons into contact sessions and
//! answers exposure queries against published reports.
//!
//! Sessions live in memory while open. A session closes once no observation
//! has arrived within the grouping window; `flush` moves closed sessions into
//! the record store. Open sessions are never evicted.
//!
//! Grouping is by time proximity only. TCNs rotate and are unlinkable, so a
//! peer whose TCN rotates mid-encounter may still land in the same session,
//! while two peers seen at the same time may share one.

use ito_core::config::SessionGrouping;
use ito_core::{now_ms, ItoError, ItoResult, ObservedBeacon, Tcn};
use ito_crypto::Report;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::{session_key, RecordStore, StoredRecord};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum gap between two observations of the same session
    pub grouping_window: Duration,
    /// Beacons timestamped further in the future are discarded
    pub max_clock_skew: Duration,
    pub grouping: SessionGrouping,
    /// Path-loss exponent for distance estimation
    pub path_loss_exponent: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&ito_core::config::CacheConfig::default())
    }
}

impl From<&ito_core::config::CacheConfig> for CacheConfig {
    fn from(config: &ito_core::config::CacheConfig) -> Self {
        Self {
            grouping_window: config.grouping_window(),
            max_clock_skew: config.max_clock_skew(),
            grouping: config.grouping,
            path_loss_exponent: config.path_loss_exponent,
        }
    }
}

/// One continuous encounter with a peer's (rotating) beacons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSession {
    pub id: String,
    /// Unix milliseconds
    pub first_seen: u64,
    /// Unix milliseconds
    pub last_seen: u64,
    /// Accumulated contact time; never decreases
    pub duration_ms: u64,
    pub tcns: BTreeSet<Tcn>,
    /// Number of observations aggregated
    pub samples: u32,
    /// Strongest signal seen, dBm
    pub peak_rssi: i8,
}

impl ContactSession {
    fn open(beacon: &ObservedBeacon) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            first_seen: beacon.observed_at,
            last_seen: beacon.observed_at,
            duration_ms: 0,
            tcns: BTreeSet::from([beacon.tcn]),
            samples: 1,
            peak_rssi: beacon.rssi,
        }
    }

    /// Fold one more observation in. Late (out-of-order) observations add
    /// their TCN but never move `last_seen` back.
    fn extend(&mut self, beacon: &ObservedBeacon) {
        if beacon.observed_at > self.last_seen {
            self.duration_ms += beacon.observed_at - self.last_seen;
            self.last_seen = beacon.observed_at;
        }
        self.tcns.insert(beacon.tcn);
        self.samples = self.samples.saturating_add(1);
        self.peak_rssi = self.peak_rssi.max(beacon.rssi);
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn contains(&self, tcn: &Tcn) -> bool {
        self.tcns.contains(tcn)
    }

    fn intersects(&self, tcns: &HashSet<Tcn>) -> bool {
        self.tcns.iter().any(|tcn| tcns.contains(tcn))
    }

    fn within_window(&self, observed_at: u64, window_ms: u64) -> bool {
        observed_at.abs_diff(self.last_seen) <= window_ms
    }

    fn lapsed(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > window_ms
    }
}

/// Result of feeding one beacon to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new session was opened
    Opened,
    /// An open session was extended
    Extended,
    /// Timestamp too far ahead of the local clock; beacon discarded
    Skewed,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Opened => "opened",
            IngestOutcome::Extended => "extended",
            IngestOutcome::Skewed => "skewed",
        }
    }
}

/// Distance estimate derived from one accepted observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityEstimate {
    pub tcn: Tcn,
    pub rssi: i8,
    /// Meters; `None` when the peer advertised no calibration byte
    pub distance_m: Option<f32>,
}

/// Notified after every accepted ingest. Called outside the cache lock.
pub trait ProximityListener: Send + Sync {
    fn on_proximity(&self, estimate: &ProximityEstimate);
}

/// Log-distance path-loss model: `10 ^ ((tx_power - rssi) / (10 n))`.
pub fn estimate_distance(tx_power: i8, rssi: i8, path_loss_exponent: f32) -> f32 {
    let loss = f32::from(tx_power) - f32::from(rssi);
    10f32.powf(loss / (10.0 * path_loss_exponent))
}

#[derive(Default)]
struct SessionTable {
    open: Vec<ContactSession>,
    /// Closed but not yet persisted
    closed: Vec<ContactSession>,
}

impl SessionTable {
    fn close_lapsed(&mut self, now: u64, window_ms: u64) -> usize {
        let (lapsed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|s| s.lapsed(now, window_ms));
        self.open = open;
        let count = lapsed.len();
        self.closed.extend(lapsed);
        count
    }

    fn all(&self) -> impl Iterator<Item = &ContactSession> {
        self.open.iter().chain(self.closed.iter())
    }
}

pub struct ContactCache<S> {
    store: Arc<S>,
    config: CacheConfig,
    sessions: Mutex<SessionTable>,
    listener: RwLock<Option<Arc<dyn ProximityListener>>>,
}

impl<S: RecordStore> ContactCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            sessions: Mutex::new(SessionTable::default()),
            listener: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn set_proximity_listener(&self, listener: Arc<dyn ProximityListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn window_ms(&self) -> u64 {
        self.config.grouping_window.as_millis() as u64
    }

    pub fn ingest(&self, beacon: ObservedBeacon) -> IngestOutcome {
        self.ingest_at(beacon, now_ms())
    }

    /// Aggregate `beacon` into the session table as of local time `now`.
    pub fn ingest_at(&self, beacon: ObservedBeacon, now: u64) -> IngestOutcome {
        let skew_ms = self.config.max_clock_skew.as_millis() as u64;
        if beacon.observed_at > now.saturating_add(skew_ms) {
            warn!(
                tcn = %beacon.tcn,
                observed_at = beacon.observed_at,
                now,
                "beacon timestamp beyond clock skew, discarded"
            );
            return IngestOutcome::Skewed;
        }

        let window_ms = self.window_ms();
        let outcome = {
            let mut table = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            table.close_lapsed(now, window_ms);

            match self.pick_session(&table.open, &beacon, window_ms) {
                Some(idx) => {
                    table.open[idx].extend(&beacon);
                    debug!(session_id = %table.open[idx].id, tcn = %beacon.tcn, "session extended");
                    IngestOutcome::Extended
                }
                None => {
                    let session = ContactSession::open(&beacon);
                    debug!(session_id = %session.id, tcn = %beacon.tcn, "session opened");
                    table.open.push(session);
                    IngestOutcome::Opened
                }
            }
        };

        self.notify(&beacon);
        outcome
    }

    /// Index of the open session `beacon` belongs to, if any.
    fn pick_session(
        &self,
        open: &[ContactSession],
        beacon: &ObservedBeacon,
        window_ms: u64,
    ) -> Option<usize> {
        let candidates = open
            .iter()
            .enumerate()
            .filter(|(_, s)| s.within_window(beacon.observed_at, window_ms));

        let mut same_tcn = None;
        let mut most_recent: Option<(usize, u64)> = None;
        for (idx, session) in candidates {
            if session.contains(&beacon.tcn) {
                same_tcn = Some(idx);
                break;
            }
            if most_recent.map_or(true, |(_, seen)| session.last_seen > seen) {
                most_recent = Some((idx, session.last_seen));
            }
        }

        match self.config.grouping {
            SessionGrouping::PerTcn => same_tcn,
            SessionGrouping::TimeWindow => same_tcn.or(most_recent.map(|(idx, _)| idx)),
        }
    }

    fn notify(&self, beacon: &ObservedBeacon) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            let estimate = ProximityEstimate {
                tcn: beacon.tcn,
                rssi: beacon.rssi,
                distance_m: beacon.tx_power.map(|tx| {
                    estimate_distance(tx, beacon.rssi, self.config.path_loss_exponent)
                }),
            };
            listener.on_proximity(&estimate);
        }
    }

    pub fn flush(&self) -> ItoResult<usize> {
        self.flush_at(now_ms())
    }

    /// Close lapsed sessions and persist every closed session.
    ///
    /// Sessions are copied under the lock, written without it, and removed
    /// from memory only once their write succeeded. On a store failure the
    /// unwritten sessions stay queued for the next flush.
    pub fn flush_at(&self, now: u64) -> ItoResult<usize> {
        let pending: Vec<ContactSession> = {
            let mut table = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            table.close_lapsed(now, self.window_ms());
            table.closed.clone()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut written = HashSet::new();
        let mut failure = None;
        for session in &pending {
            match self
                .store
                .upsert(&session_key(&session.id), &StoredRecord::Session(session.clone()))
            {
                Ok(()) => {
                    written.insert(session.id.clone());
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        {
            let mut table = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            table.closed.retain(|s| !written.contains(&s.id));
        }

        match failure {
            Some(e) => {
                warn!(
                    written = written.len(),
                    pending = pending.len(),
                    "session flush incomplete: {e}"
                );
                Err(e)
            }
            None => {
                debug!(count = written.len(), "sessions flushed");
                Ok(written.len())
            }
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .len()
    }

    /// Closed sessions waiting for the next flush.
    pub fn pending_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .len()
    }

    /// Copy of every in-memory session, open and closed.
    pub fn snapshot(&self) -> Vec<ContactSession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .all()
            .cloned()
            .collect()
    }

    /// Total exposure to the TCNs disclosed by `report`.
    pub fn check_exposure(&self, report: &Report) -> ItoResult<Duration> {
        self.exposure_for(std::slice::from_ref(report))
    }

    /// Decode untrusted report bytes and check them.
    pub fn check_report_bytes(&self, encoded: &[u8]) -> ItoResult<Duration> {
        let report =
            Report::decode(encoded).map_err(|e| ItoError::InvalidReport(e.to_string()))?;
        self.check_exposure(&report)
    }

    /// Sum of durations over every session (in memory or persisted) that saw
    /// any TCN disclosed by any of `reports`. Each session counts once.
    pub fn exposure_for(&self, reports: &[Report]) -> ItoResult<Duration> {
        let disclosed: HashSet<Tcn> = reports.iter().flat_map(|r| r.tcns()).collect();
        if disclosed.is_empty() {
            return Ok(Duration::ZERO);
        }

        // Memory first: a session flushed in between shows up in the store
        // scan instead and is deduplicated by id.
        let mut matched: HashMap<String, u64> = {
            let table = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .all()
                .filter(|s| s.intersects(&disclosed))
                .map(|s| (s.id.clone(), s.duration_ms))
                .collect()
        };

        for session in self.store.sessions()? {
            if session.intersects(&disclosed) {
                matched.entry(session.id).or_insert(session.duration_ms);
            }
        }

        let total: u64 = matched.values().sum();
        Ok(Duration::from_millis(total))
    }
}
