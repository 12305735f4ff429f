//! Report board: the shared index where diagnosed devices publish reports
//! and every device polls for new ones.
//!
//! Layout: `{prefix}/reports/{published_at_ms:020}-{blake3[..16]}.bin`
//!
//! The zero-padded publication time makes lexical order equal publication
//! order, and doubles as the fetch checkpoint: a device remembers the largest
//! timestamp it has processed and only downloads objects named after it.
//!
//! Names carry the publisher's clock, so a publisher running behind can write
//! an object that sorts before a checkpoint already handed out. Every fetch
//! therefore reaches `lookback` before the checkpoint; readers deduplicate
//! the overlap by content.

use anyhow::{Context, Result};
use ito_core::now_ms;
use opendal::{ErrorKind, Operator};
use std::time::Duration;
use tracing::{debug, info};

/// Default reach before the checkpoint on every fetch.
pub const DEFAULT_FETCH_LOOKBACK: Duration = Duration::from_secs(10 * 60);

/// Reports downloaded by one `fetch_since` call.
#[derive(Debug, Clone, Default)]
pub struct FetchedReports {
    /// Raw encoded reports, oldest first
    pub reports: Vec<Vec<u8>>,
    /// Checkpoint to pass to the next `fetch_since`
    pub checkpoint: u64,
}

#[derive(Clone)]
pub struct ReportBoard {
    op: Operator,
    prefix: String,
    lookback: Duration,
}

impl ReportBoard {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            op,
            prefix,
            lookback: DEFAULT_FETCH_LOOKBACK,
        }
    }

    /// How far before the checkpoint each fetch re-lists. Should be at least
    /// the clock skew tolerated between publishers.
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn reports_dir(&self) -> String {
        if self.prefix.is_empty() {
            "reports/".to_string()
        } else {
            format!("{}/reports/", self.prefix)
        }
    }

    /// Upload encoded reports. Returns the object paths written.
    ///
    /// Uploading the same report twice creates a second object; consumers
    /// deduplicate by content.
    pub async fn publish(&self, reports: &[Vec<u8>]) -> Result<Vec<String>> {
        let published_at = now_ms();
        let dir = self.reports_dir();
        let mut paths = Vec::with_capacity(reports.len());

        for report in reports {
            let hash = blake3::hash(report);
            let path = format!("{dir}{published_at:020}-{}.bin", &hash.to_hex()[..16]);
            self.op
                .write(&path, report.clone())
                .await
                .with_context(|| format!("uploading report: {path}"))?;
            debug!(path = %path, bytes = report.len(), "report uploaded");
            paths.push(path);
        }

        info!(count = paths.len(), published_at, "reports published");
        Ok(paths)
    }

    /// Download every report named after `checkpoint - lookback`.
    ///
    /// Either all new reports are returned or an error is; the checkpoint only
    /// moves forward on success. Reports inside the lookback are returned
    /// again on every call.
    pub async fn fetch_since(&self, checkpoint: u64) -> Result<FetchedReports> {
        let dir = self.reports_dir();
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(anyhow::anyhow!("listing {dir}: {e}")),
        };

        let since = checkpoint.saturating_sub(self.lookback.as_millis() as u64);
        let mut pending: Vec<(u64, String)> = entries
            .iter()
            .filter_map(|entry| {
                let name = entry.name();
                let published_at = parse_published_at(name)?;
                (published_at > since).then(|| (published_at, format!("{dir}{name}")))
            })
            .collect();
        pending.sort();

        let mut fetched = FetchedReports {
            reports: Vec::with_capacity(pending.len()),
            checkpoint,
        };
        for (published_at, path) in pending {
            let data = self
                .op
                .read(&path)
                .await
                .with_context(|| format!("downloading report: {path}"))?;
            fetched.reports.push(data.to_vec());
            fetched.checkpoint = fetched.checkpoint.max(published_at);
        }

        debug!(
            new_reports = fetched.reports.len(),
            checkpoint = fetched.checkpoint,
            "report board polled"
        );
        Ok(fetched)
    }
}

/// `00000001700000000000-0123456789abcdef.bin` → `1700000000000`
fn parse_published_at(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".bin")?;
    let (ts, _) = stem.split_once('-')?;
    ts.parse().ok()
}
