//! Retention purge: local records older than the retention period are deleted.

use ito_core::ItoResult;
use std::time::Duration;
use tracing::info;

use crate::store::{RecordStore, StoredRecord, RATCHET_PREFIX, REPORT_PREFIX, SESSION_PREFIX};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub sessions: usize,
    pub ratchets: usize,
    pub reports: usize,
}

impl PurgeSummary {
    pub fn total(&self) -> usize {
        self.sessions + self.ratchets + self.reports
    }
}

/// Delete sessions last seen, ratchets created and reports fetched before
/// `now - retention`. `now` is Unix milliseconds.
pub fn purge_expired<S: RecordStore + ?Sized>(
    store: &S,
    now: u64,
    retention: Duration,
) -> ItoResult<PurgeSummary> {
    let cutoff = now.saturating_sub(retention.as_millis() as u64);

    let sessions = store.delete_where(SESSION_PREFIX, &|_, record| {
        matches!(record, StoredRecord::Session(s) if s.last_seen < cutoff)
    })?;
    let ratchets = store.delete_where(RATCHET_PREFIX, &|_, record| {
        matches!(record, StoredRecord::Ratchet(r) if r.created_at() < cutoff)
    })?;
    let reports = store.delete_where(REPORT_PREFIX, &|_, record| {
        matches!(record, StoredRecord::Report(r) if r.fetched_at < cutoff)
    })?;

    let summary = PurgeSummary {
        sessions,
        ratchets,
        reports,
    };
    if summary.total() > 0 {
        info!(
            sessions,
            ratchets,
            reports,
            cutoff,
            "expired records purged"
        );
    }
    Ok(summary)
}
