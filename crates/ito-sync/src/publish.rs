//! Disclosure: turn stored ratchets into reports, publish them, and only then
//! delete the disclosed secret material.
//!
//! Ordering per ratchet set:
//!   1. build reports for the ticks advertised inside the requested window
//!   2. publish; on failure stop here, nothing is deleted
//!   3. retire any disclosed ratchet the scheduler is still ticking
//!   4. delete ratchets whose every generated tick was disclosed, mark the
//!      rest retired
//!
//! A failure in 3 or 4 leaves the material in place and reports `purged = false`;
//! publishing the same range again later is harmless.

use async_trait::async_trait;
use ito_core::config::RatchetConfig;
use ito_core::{ItoError, ItoResult};
use ito_crypto::{RatchetState, Report};
use ito_storage::ReportBoard;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ratchet_key, RecordStore, StoredRecord, RATCHET_PREFIX};

/// Where disclosure reports are sent.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    /// Deliver every encoded report. Returns only once delivery is confirmed.
    async fn publish(&self, reports: &[Vec<u8>]) -> ItoResult<()>;
}

#[async_trait]
impl ReportPublisher for ReportBoard {
    async fn publish(&self, reports: &[Vec<u8>]) -> ItoResult<()> {
        ReportBoard::publish(self, reports)
            .await
            .map(|_| ())
            .map_err(|e| ItoError::PublishFailed(format!("{e:#}")))
    }
}

/// Stops live ratchets from producing further TCNs once disclosed.
#[async_trait]
pub trait RatchetRetirer: Send + Sync {
    async fn retire(&self, ids: &[String]) -> ItoResult<()>;
}

#[derive(Debug, Clone)]
pub struct DisclosureConfig {
    /// How long each tick's TCN is advertised
    pub tcn_valid_interval: Duration,
    /// Maximum ticks one report may disclose
    pub max_report_span: u32,
    /// Attached to every report
    pub memo: Vec<u8>,
}

impl From<&RatchetConfig> for DisclosureConfig {
    fn from(config: &RatchetConfig) -> Self {
        Self {
            tcn_valid_interval: config.tcn_valid_interval(),
            max_report_span: config.max_report_span,
            memo: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published {
        reports: usize,
        /// Ids of the disclosed ratchets
        ratchets: Vec<String>,
        /// Disclosed ratchets kept, retired, because some of their ticks fell
        /// outside the window
        retained: Vec<String>,
        /// Whether every fully disclosed ratchet record was deleted
        purged: bool,
    },
    /// No stored ratchet generated a tick inside the window
    NothingToPublish,
}

/// Range of ticks advertised at some point inside `[from_ms, to_ms]`.
///
/// Tick `i` is on air from `tick_times[i]` until the next tick or until
/// `interval` has passed, whichever comes first, so gaps where the device was
/// off are never attributed to any tick. A tick cut short by an immediate
/// successor still counts when it started inside the window.
pub fn ticks_in_window(
    tick_times: &[u64],
    interval: Duration,
    from_ms: u64,
    to_ms: u64,
) -> Option<(u32, u32)> {
    if from_ms > to_ms {
        return None;
    }
    let interval_ms = interval.as_millis() as u64;
    let mut hull: Option<(u32, u32)> = None;
    for (i, &start) in tick_times.iter().enumerate() {
        let mut end = start.saturating_add(interval_ms);
        if let Some(&next) = tick_times.get(i + 1) {
            end = end.min(next.max(start));
        }
        let on_air = start <= to_ms && (end > from_ms || start >= from_ms);
        if !on_air {
            continue;
        }
        let Ok(i) = u32::try_from(i) else { break };
        hull = Some(match hull {
            Some((lo, hi)) => (lo.min(i), hi.max(i)),
            None => (i, i),
        });
    }
    hull
}

/// Split `[start, end]` into consecutive ranges of at most `max_span` ticks.
fn split_span(start: u32, end: u32, max_span: u32) -> Vec<(u32, u32)> {
    let max_span = max_span.max(1);
    let mut out = Vec::new();
    let mut lo = start;
    loop {
        let hi = lo.saturating_add(max_span - 1).min(end);
        out.push((lo, hi));
        if hi >= end {
            break;
        }
        lo = hi + 1;
    }
    out
}

pub struct DisclosureTask<S> {
    store: Arc<S>,
    publisher: Arc<dyn ReportPublisher>,
    config: DisclosureConfig,
}

impl<S: RecordStore> DisclosureTask<S> {
    pub fn new(store: Arc<S>, publisher: Arc<dyn ReportPublisher>, config: DisclosureConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Reports for every ratchet that was on air inside the window, together
    /// with the disclosed tick range per ratchet id.
    fn reports_for_window(
        &self,
        ratchets: &[RatchetState],
        from_ms: u64,
        to_ms: u64,
    ) -> ItoResult<(Vec<Report>, HashMap<String, (u32, u32)>)> {
        let mut reports = Vec::new();
        let mut covered = HashMap::new();
        for ratchet in ratchets {
            let Some((start, end)) = ticks_in_window(
                ratchet.tick_times(),
                self.config.tcn_valid_interval,
                from_ms,
                to_ms,
            ) else {
                continue;
            };
            for (lo, hi) in split_span(start, end, self.config.max_report_span) {
                reports.push(ratchet.report_for_range(
                    lo,
                    hi,
                    self.config.max_report_span,
                    self.config.memo.clone(),
                )?);
            }
            debug!(ratchet_id = ratchet.id(), start, end, "reports built");
            covered.insert(ratchet.id().to_string(), (start, end));
        }
        Ok((reports, covered))
    }

    /// Disclose every tick advertised between `from_ms` and `to_ms`.
    pub async fn publish(
        &self,
        from_ms: u64,
        to_ms: u64,
        retirer: Option<&dyn RatchetRetirer>,
    ) -> ItoResult<PublishOutcome> {
        let ratchets = self.store.ratchets()?;
        let (reports, covered) = self.reports_for_window(&ratchets, from_ms, to_ms)?;
        if reports.is_empty() {
            info!(from_ms, to_ms, "no ratchet material in window, nothing to publish");
            return Ok(PublishOutcome::NothingToPublish);
        }

        let encoded: Vec<Vec<u8>> = reports.iter().map(Report::encode).collect();
        if let Err(e) = self.publisher.publish(&encoded).await {
            warn!(reports = encoded.len(), "publish failed, ratchet material retained: {e}");
            return Err(match e {
                ItoError::PublishFailed(_) => e,
                other => ItoError::PublishFailed(other.to_string()),
            });
        }
        info!(reports = encoded.len(), ratchets = covered.len(), "reports published");

        let mut ids: Vec<String> = covered.keys().cloned().collect();
        ids.sort();
        let (retained, purged) = self.purge(&ids, &covered, retirer).await;
        Ok(PublishOutcome::Published {
            reports: encoded.len(),
            ratchets: ids,
            retained,
            purged,
        })
    }

    /// Retire, then delete what was fully disclosed and mark the rest retired.
    /// Any failure keeps the material.
    async fn purge(
        &self,
        ids: &[String],
        covered: &HashMap<String, (u32, u32)>,
        retirer: Option<&dyn RatchetRetirer>,
    ) -> (Vec<String>, bool) {
        if let Some(retirer) = retirer {
            if let Err(e) = retirer.retire(ids).await {
                warn!("could not retire disclosed ratchets, keeping them: {e}");
                return (ids.to_vec(), false);
            }
        }

        let by_key: HashMap<String, (u32, u32)> = covered
            .iter()
            .map(|(id, range)| (ratchet_key(id), *range))
            .collect();
        let deleted_ids = RefCell::new(HashSet::new());
        // Checked against the record as stored now, so ticks generated after
        // the reports were built keep the ratchet alive.
        let fully_disclosed = |key: &str, record: &StoredRecord| match (by_key.get(key), record) {
            (Some(&(start, end)), StoredRecord::Ratchet(state))
                if start == 0 && state.tick_index() <= end.saturating_add(1) =>
            {
                deleted_ids.borrow_mut().insert(state.id().to_string());
                true
            }
            _ => false,
        };

        let mut purged = match self.store.delete_where(RATCHET_PREFIX, &fully_disclosed) {
            Ok(deleted) => {
                info!(deleted, "disclosed ratchet material deleted");
                true
            }
            Err(e) => {
                warn!("ratchet material kept after publish: {e}");
                deleted_ids.borrow_mut().clear();
                false
            }
        };

        let deleted_ids = deleted_ids.into_inner();
        let retained: Vec<String> = ids
            .iter()
            .filter(|id| !deleted_ids.contains(*id))
            .cloned()
            .collect();
        for id in &retained {
            if let Err(e) = self.mark_retired(id) {
                warn!(ratchet_id = %id, "could not mark partly disclosed ratchet retired: {e}");
                purged = false;
            }
        }
        if !retained.is_empty() {
            info!(
                retained = retained.len(),
                "partly disclosed ratchets kept until retention expiry"
            );
        }
        (retained, purged)
    }

    fn mark_retired(&self, id: &str) -> ItoResult<()> {
        let key = ratchet_key(id);
        if let Some(StoredRecord::Ratchet(mut state)) = self.store.get(&key)? {
            if !state.is_retired() {
                state.retire();
                self.store.upsert(&key, &StoredRecord::Ratchet(state))?;
            }
        }
        Ok(())
    }
}

/// Run a disclosure off the caller's task.
pub fn spawn_publish<S: RecordStore>(
    task: Arc<DisclosureTask<S>>,
    from_ms: u64,
    to_ms: u64,
    retirer: Option<Arc<dyn RatchetRetirer>>,
) -> JoinHandle<ItoResult<PublishOutcome>> {
    tokio::spawn(async move { task.publish(from_ms, to_ms, retirer.as_deref()).await })
}
