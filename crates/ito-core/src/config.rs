use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration (loaded from itod.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItoConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub store: StoreConfig,
    pub ratchet: RatchetConfig,
    pub cache: CacheConfig,
    pub exposure: ExposureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path for gRPC (default: /run/itod/itod.sock)
    pub socket: PathBuf,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9110)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Which OpenDAL service backs the report index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    /// Process-local index, for development and tests
    Memory,
}

/// Report index (the server side of publish / fetch)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Key prefix under which reports are stored
    pub prefix: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// How far before the fetch checkpoint each poll re-lists, to catch
    /// reports named by publishers with lagging clocks
    pub fetch_lookback_secs: u64,
}

/// Local record store holding ratchets, sessions and fetched reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `.json` → JSON file, `:memory:` → in-process, anything else → RocksDB (feature `full`)
    pub path: PathBuf,
    /// Attempts to persist ratchet state after a tick before giving up
    pub persist_retries: u32,
    /// Initial backoff between persist attempts, doubled each retry
    pub persist_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// How long one TCN is advertised before the ratchet ticks
    pub tcn_valid_interval_secs: u64,
    /// Ticks per ratchet before it is discarded and a fresh one created
    pub exchange_interval: u32,
    /// Maximum number of ticks a single report may disclose
    pub max_report_span: u32,
    /// Calibration byte appended to the advertised TCN (dBm at 1m)
    pub tx_power_calibration: Option<i8>,
}

/// How observations are grouped into contact sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionGrouping {
    /// Group purely by temporal proximity (TCNs are unlinkable by design)
    #[default]
    TimeWindow,
    /// Only extend sessions that already saw the same TCN
    PerTcn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum gap between observations belonging to one session
    pub grouping_window_secs: u64,
    /// Beacons timestamped further than this into the future are discarded
    pub max_clock_skew_secs: u64,
    /// How often closed sessions are flushed to the store
    pub flush_interval_secs: u64,
    pub grouping: SessionGrouping,
    /// Local records older than this are purged
    pub retention_days: u64,
    /// Path-loss exponent for RSSI → distance estimation (2.0 = free space)
    pub path_loss_exponent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Accumulated exposure above which the device is possibly infected
    pub min_exposure_duration_secs: u64,
    /// How often the report index is polled for new reports
    pub check_server_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/itod/itod.sock"),
            metrics_addr: Some("127.0.0.1:9110".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "ito-reports".into(),
            prefix: "ito".into(),
            enforce_tls: false,
            fetch_lookback_secs: 10 * 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/itod/records.json"),
            persist_retries: 3,
            persist_backoff_ms: 200,
        }
    }
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            tcn_valid_interval_secs: 15 * 60,
            exchange_interval: 96,
            max_report_span: 96,
            tx_power_calibration: Some(-59),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grouping_window_secs: 5 * 60,
            max_clock_skew_secs: 2 * 60,
            flush_interval_secs: 60,
            grouping: SessionGrouping::TimeWindow,
            retention_days: 14,
            path_loss_exponent: 2.0,
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            min_exposure_duration_secs: 15 * 60,
            check_server_interval_secs: 60 * 60,
        }
    }
}

impl StorageConfig {
    pub fn fetch_lookback(&self) -> Duration {
        Duration::from_secs(self.fetch_lookback_secs)
    }
}

impl RatchetConfig {
    pub fn tcn_valid_interval(&self) -> Duration {
        Duration::from_secs(self.tcn_valid_interval_secs)
    }
}

impl CacheConfig {
    pub fn grouping_window(&self) -> Duration {
        Duration::from_secs(self.grouping_window_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

impl ExposureConfig {
    pub fn min_exposure_duration(&self) -> Duration {
        Duration::from_secs(self.min_exposure_duration_secs)
    }

    pub fn check_server_interval(&self) -> Duration {
        Duration::from_secs(self.check_server_interval_secs)
    }
}

impl ItoConfig {
    /// Reject combinations that would make the ratchet or cache misbehave.
    pub fn validate(&self) -> crate::ItoResult<()> {
        use crate::ItoError;

        if self.ratchet.exchange_interval == 0 {
            return Err(ItoError::Config("ratchet.exchange_interval must be > 0".into()));
        }
        if self.ratchet.tcn_valid_interval_secs == 0 {
            return Err(ItoError::Config(
                "ratchet.tcn_valid_interval_secs must be > 0".into(),
            ));
        }
        if self.ratchet.max_report_span == 0 {
            return Err(ItoError::Config("ratchet.max_report_span must be > 0".into()));
        }
        if self.cache.grouping_window_secs == 0 {
            return Err(ItoError::Config("cache.grouping_window_secs must be > 0".into()));
        }
        if self.cache.flush_interval_secs == 0 {
            return Err(ItoError::Config("cache.flush_interval_secs must be > 0".into()));
        }
        if self.exposure.check_server_interval_secs == 0 {
            return Err(ItoError::Config(
                "exposure.check_server_interval_secs must be > 0".into(),
            ));
        }
        if self.storage.fetch_lookback_secs < self.cache.max_clock_skew_secs {
            return Err(ItoError::Config(
                "storage.fetch_lookback_secs must be >= cache.max_clock_skew_secs".into(),
            ));
        }
        if !(self.cache.path_loss_exponent > 0.0) {
            return Err(ItoError::Config("cache.path_loss_exponent must be > 0".into()));
        }
        Ok(())
    }
}
