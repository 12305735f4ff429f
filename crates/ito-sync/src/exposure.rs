//! Exposure tracking: pull new reports from the report index, keep them in the
//! record store, and decide whether accumulated exposure crosses the threshold.

use async_trait::async_trait;
use ito_core::{now_ms, ItoError, ItoResult};
use ito_crypto::Report;
use ito_storage::ReportBoard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::ContactCache;
use crate::store::{report_key, RecordStore, StoredRecord, StoredReport, CHECKPOINT_KEY};

/// Reports returned by one fetch, plus the checkpoint to resume from.
#[derive(Debug, Clone, Default)]
pub struct ReportBatch {
    pub reports: Vec<Vec<u8>>,
    pub checkpoint: u64,
}

/// Where published reports are read from.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Every report published after `checkpoint`.
    async fn fetch_since(&self, checkpoint: u64) -> ItoResult<ReportBatch>;
}

#[async_trait]
impl ReportSource for ReportBoard {
    async fn fetch_since(&self, checkpoint: u64) -> ItoResult<ReportBatch> {
        let fetched = ReportBoard::fetch_since(self, checkpoint)
            .await
            .map_err(|e| ItoError::FetchFailed(format!("{e:#}")))?;
        Ok(ReportBatch {
            reports: fetched.reports,
            checkpoint: fetched.checkpoint,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExposureConfig {
    /// Exposure strictly above this marks the device as possibly infected
    pub min_exposure_duration: Duration,
}

impl From<&ito_core::config::ExposureConfig> for ExposureConfig {
    fn from(config: &ito_core::config::ExposureConfig) -> Self {
        Self {
            min_exposure_duration: config.min_exposure_duration(),
        }
    }
}

/// What one `sync_from` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub fetched: usize,
    /// Newly stored (not seen before)
    pub stored: usize,
    /// Malformed or unsupported, dropped
    pub discarded: usize,
    pub checkpoint: u64,
}

pub struct ExposureTracker<S> {
    store: Arc<S>,
    cache: Arc<ContactCache<S>>,
    config: ExposureConfig,
}

impl<S: RecordStore> ExposureTracker<S> {
    pub fn new(store: Arc<S>, cache: Arc<ContactCache<S>>, config: ExposureConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Fetch reports newer than the stored checkpoint, store the valid ones
    /// and advance the checkpoint.
    ///
    /// Untrusted input never aborts the pass: undecodable reports are logged
    /// and skipped. The checkpoint is written last, so a failure anywhere
    /// before it makes the next pass re-fetch the same batch.
    pub async fn sync_from(&self, source: &dyn ReportSource) -> ItoResult<SyncSummary> {
        let checkpoint = self.store.checkpoint()?;
        let batch = source.fetch_since(checkpoint).await?;

        let mut summary = SyncSummary {
            fetched: batch.reports.len(),
            checkpoint,
            ..SyncSummary::default()
        };

        let fetched_at = now_ms();
        for bytes in batch.reports {
            if let Err(e) = Report::decode(&bytes) {
                warn!(bytes = bytes.len(), "discarding report: {e}");
                summary.discarded += 1;
                continue;
            }

            let key = report_key(&bytes);
            if self.store.get(&key)?.is_some() {
                continue;
            }
            self.store.upsert(
                &key,
                &StoredRecord::Report(StoredReport { bytes, fetched_at }),
            )?;
            summary.stored += 1;
        }

        if batch.checkpoint > checkpoint {
            self.store.upsert(
                CHECKPOINT_KEY,
                &StoredRecord::Checkpoint {
                    value: batch.checkpoint,
                },
            )?;
            summary.checkpoint = batch.checkpoint;
        }

        info!(
            fetched = summary.fetched,
            stored = summary.stored,
            discarded = summary.discarded,
            checkpoint = summary.checkpoint,
            "report sync complete"
        );
        Ok(summary)
    }

    /// Every stored report that still decodes.
    pub fn known_reports(&self) -> ItoResult<Vec<Report>> {
        Ok(self
            .store
            .reports()?
            .into_iter()
            .filter_map(|stored| match Report::decode(&stored.bytes) {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("stored report no longer decodes: {e}");
                    None
                }
            })
            .collect())
    }

    /// Exposure across every known report.
    pub fn total_exposure(&self) -> ItoResult<Duration> {
        let reports = self.known_reports()?;
        self.cache.exposure_for(&reports)
    }

    /// Total exposure and whether it crosses the threshold, from one evaluation.
    pub fn evaluate(&self) -> ItoResult<(Duration, bool)> {
        let exposure = self.total_exposure()?;
        let infected = exposure > self.config.min_exposure_duration;
        debug!(
            exposure_ms = exposure.as_millis() as u64,
            threshold_ms = self.config.min_exposure_duration.as_millis() as u64,
            infected,
            "exposure evaluated"
        );
        Ok((exposure, infected))
    }

    /// Recomputed from current state on every call.
    pub fn is_possibly_infected(&self) -> ItoResult<bool> {
        Ok(self.evaluate()?.1)
    }

    /// How far into the report index this device has checked.
    pub fn current_fetch_checkpoint(&self) -> ItoResult<u64> {
        self.store.checkpoint()
    }
}
