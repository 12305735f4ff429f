//! ito-sync: local record store, contact cache, exposure tracking,
//! disclosure and the beacon scheduler

pub mod cache;
pub mod exposure;
pub mod publish;
pub mod retention;
pub mod scheduler;
pub mod store;

pub use cache::{
    CacheConfig, ContactCache, ContactSession, IngestOutcome, ProximityEstimate,
    ProximityListener,
};
pub use exposure::{ExposureConfig, ExposureTracker, ReportBatch, ReportSource, SyncSummary};
pub use publish::{
    spawn_publish, DisclosureConfig, DisclosureTask, PublishOutcome, RatchetRetirer,
    ReportPublisher,
};
pub use retention::{purge_expired, PurgeSummary};
pub use scheduler::{
    Advertiser, BeaconScheduler, SchedulerConfig, SchedulerHandle, SchedulerSnapshot,
    SchedulerStats, SchedulerStatus,
};
pub use store::{MemoryStore, RecordStore, StoreBackend, StoredRecord, StoredReport};
