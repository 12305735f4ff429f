//! Local record store: ratchets, contact sessions, fetched reports, checkpoints.
//!
//! Three backends are available:
//!   - **Memory**: a `BTreeMap` behind a mutex, for tests and `:memory:` paths.
//!   - **JSON** (default): in-memory map mirrored to one JSON file, written
//!     through atomically via temp+rename on every change.
//!   - **RocksDB** (behind `full` feature): write-through to RocksDB.
//!
//! All implement `RecordStore`, a key-ordered store with four operations:
//! upsert-by-key, point lookup, prefix scan and delete-matching-a-predicate.
//!
//! Key layout:
//!   `ratchet/{created_at:020}-{uuid}`  → `StoredRecord::Ratchet`
//!   `session/{uuid}`                   → `StoredRecord::Session`
//!   `report/{blake3 hex}`              → `StoredRecord::Report`
//!   `meta/fetch_checkpoint`            → `StoredRecord::Checkpoint`

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ito_core::{ItoError, ItoResult};
use ito_crypto::RatchetState;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::cache::ContactSession;

pub const RATCHET_PREFIX: &str = "ratchet/";
pub const SESSION_PREFIX: &str = "session/";
pub const REPORT_PREFIX: &str = "report/";
pub const CHECKPOINT_KEY: &str = "meta/fetch_checkpoint";

pub fn ratchet_key(id: &str) -> String {
    format!("{RATCHET_PREFIX}{id}")
}

pub fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Reports are keyed by content so re-fetching the same bytes is a no-op.
pub fn report_key(encoded: &[u8]) -> String {
    format!("{REPORT_PREFIX}{}", blake3::hash(encoded).to_hex())
}

/// A report downloaded from the report index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReport {
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub bytes: Vec<u8>,
    /// Unix milliseconds
    pub fetched_at: u64,
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    STANDARD.decode(s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Ratchet(RatchetState),
    Session(ContactSession),
    Report(StoredReport),
    Checkpoint { value: u64 },
}

/// Key-ordered record store.
///
/// Implementations are internally synchronized; every method takes `&self`
/// and a single call is atomic with respect to other calls.
pub trait RecordStore: Send + Sync + 'static {
    fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()>;

    fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>>;

    /// All records whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>>;

    /// Delete every record under `prefix` matching `pred`. Returns the number
    /// of records deleted. Either all matching records go or none do.
    fn delete_where(
        &self,
        prefix: &str,
        pred: &dyn Fn(&str, &StoredRecord) -> bool,
    ) -> ItoResult<usize>;

    fn ratchets(&self) -> ItoResult<Vec<RatchetState>> {
        Ok(self
            .scan_prefix(RATCHET_PREFIX)?
            .into_iter()
            .filter_map(|(_, record)| match record {
                StoredRecord::Ratchet(state) => Some(state),
                _ => None,
            })
            .collect())
    }

    fn sessions(&self) -> ItoResult<Vec<ContactSession>> {
        Ok(self
            .scan_prefix(SESSION_PREFIX)?
            .into_iter()
            .filter_map(|(_, record)| match record {
                StoredRecord::Session(session) => Some(session),
                _ => None,
            })
            .collect())
    }

    fn reports(&self) -> ItoResult<Vec<StoredReport>> {
        Ok(self
            .scan_prefix(REPORT_PREFIX)?
            .into_iter()
            .filter_map(|(_, record)| match record {
                StoredRecord::Report(report) => Some(report),
                _ => None,
            })
            .collect())
    }

    fn checkpoint(&self) -> ItoResult<u64> {
        match self.get(CHECKPOINT_KEY)? {
            Some(StoredRecord::Checkpoint { value }) => Ok(value),
            _ => Ok(0),
        }
    }
}

// ── Memory backend ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(scan_map(&entries, prefix))
    }

    fn delete_where(
        &self,
        prefix: &str,
        pred: &dyn Fn(&str, &StoredRecord) -> bool,
    ) -> ItoResult<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(remove_matching(&mut entries, prefix, pred).len())
    }
}

fn scan_map(map: &BTreeMap<String, StoredRecord>, prefix: &str) -> Vec<(String, StoredRecord)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn remove_matching(
    map: &mut BTreeMap<String, StoredRecord>,
    prefix: &str,
    pred: &dyn Fn(&str, &StoredRecord) -> bool,
) -> Vec<(String, StoredRecord)> {
    let doomed: Vec<String> = map
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .filter(|(k, v)| pred(k, v))
        .map(|(k, _)| k.clone())
        .collect();
    doomed
        .into_iter()
        .filter_map(|k| map.remove(&k).map(|v| (k, v)))
        .collect()
}

// ── JSON file backend ────────────────────────────────────────────────────────

/// In-memory map persisted to a JSON file.
///
/// Every mutation rewrites the file (temp file, then rename). If the write
/// fails the in-memory change is rolled back, so memory never runs ahead of
/// disk and the caller sees `StoreUnavailable`.
pub struct JsonStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredRecord>>,
}

impl JsonStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> ItoResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                ItoError::store(format!("parsing record store {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, StoredRecord>) -> ItoResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ItoError::store(format!("creating store dir {}: {e}", parent.display()))
            })?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ItoError::store(format!("serializing record store: {e}")))?;

        // Ratchet seeds are in here: owner-only from the moment the file exists
        let tmp_path = self.path.with_extension("tmp");
        create_owner_only(&tmp_path)
            .and_then(|file| write_synced(file, json.as_bytes()))
            .map_err(|e| {
                ItoError::store(format!("writing record store {}: {e}", tmp_path.display()))
            })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            ItoError::store(format!("renaming record store {}: {e}", self.path.display()))
        })
    }
}

#[cfg(unix)]
fn create_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // A stale temp file keeps its old mode through open
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn write_synced(mut file: std::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    file.write_all(bytes)?;
    file.sync_all()
}

impl RecordStore for JsonStore {
    fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.insert(key.to_string(), record.clone());

        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(prev) => entries.insert(key.to_string(), prev),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(scan_map(&entries, prefix))
    }

    fn delete_where(
        &self,
        prefix: &str,
        pred: &dyn Fn(&str, &StoredRecord) -> bool,
    ) -> ItoResult<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = remove_matching(&mut entries, prefix, pred);
        if removed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.persist(&entries) {
            entries.extend(removed);
            return Err(e);
        }
        Ok(removed.len())
    }
}

// ── RocksDB backend ──────────────────────────────────────────────────────────

#[cfg(feature = "full")]
mod rocksdb_backend {
    use super::*;

    /// RocksDB-backed record store. Values are JSON-encoded `StoredRecord`s;
    /// RocksDB's WAL handles durability.
    pub struct RocksStore {
        db: rocksdb::DB,
    }

    impl RocksStore {
        /// Open or create a RocksDB record store at the given path.
        pub fn open(path: &Path) -> ItoResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);

            let db = rocksdb::DB::open(&opts, path)
                .map_err(|e| ItoError::store(format!("opening RocksDB {}: {e}", path.display())))?;
            Ok(Self { db })
        }
    }

    impl RecordStore for RocksStore {
        fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()> {
            let json = serde_json::to_vec(record)
                .map_err(|e| ItoError::store(format!("serializing {key}: {e}")))?;
            self.db
                .put(key.as_bytes(), json)
                .map_err(|e| ItoError::store(format!("RocksDB put {key}: {e}")))
        }

        fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>> {
            let Some(bytes) = self
                .db
                .get(key.as_bytes())
                .map_err(|e| ItoError::store(format!("RocksDB get {key}: {e}")))?
            else {
                return Ok(None);
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ItoError::store(format!("decoding {key}: {e}")))
        }

        fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>> {
            let mode = rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
            let mut out = Vec::new();
            for item in self.db.iterator(mode) {
                let (key_bytes, value_bytes) =
                    item.map_err(|e| ItoError::store(format!("iterating RocksDB: {e}")))?;
                if !key_bytes.starts_with(prefix.as_bytes()) {
                    break;
                }
                let key = String::from_utf8_lossy(&key_bytes).into_owned();
                match serde_json::from_slice::<StoredRecord>(&value_bytes) {
                    Ok(record) => out.push((key, record)),
                    Err(e) => tracing::warn!(key = %key, "skipping undecodable record: {e}"),
                }
            }
            Ok(out)
        }

        fn delete_where(
            &self,
            prefix: &str,
            pred: &dyn Fn(&str, &StoredRecord) -> bool,
        ) -> ItoResult<usize> {
            let mut batch = rocksdb::WriteBatch::default();
            let mut count = 0;
            for (key, record) in self.scan_prefix(prefix)? {
                if pred(&key, &record) {
                    batch.delete(key.as_bytes());
                    count += 1;
                }
            }
            if count > 0 {
                self.db
                    .write(batch)
                    .map_err(|e| ItoError::store(format!("RocksDB batch delete: {e}")))?;
            }
            Ok(count)
        }
    }
}

#[cfg(feature = "full")]
pub use rocksdb_backend::RocksStore;

/// Dispatch enum that wraps any of the store backends.
///
/// Used by `itod` to select a backend at runtime based on the configured path.
pub enum StoreBackend {
    Memory(MemoryStore),
    Json(JsonStore),
    #[cfg(feature = "full")]
    Rocks(RocksStore),
}

impl StoreBackend {
    /// Open the appropriate backend for `path`.
    ///
    /// `:memory:` is in-process only; paths ending in `.json` use the JSON
    /// backend; anything else uses RocksDB (if compiled with `full`).
    pub fn open(path: &Path) -> ItoResult<Self> {
        if path.as_os_str() == ":memory:" {
            return Ok(StoreBackend::Memory(MemoryStore::new()));
        }

        let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);

        #[cfg(feature = "full")]
        if !is_json {
            return Ok(StoreBackend::Rocks(RocksStore::open(path)?));
        }

        #[cfg(not(feature = "full"))]
        if !is_json {
            tracing::warn!(
                path = %path.display(),
                "RocksDB not compiled in (missing 'full' feature), falling back to JSON backend"
            );
            return Ok(StoreBackend::Json(JsonStore::open(
                &path.with_extension("json"),
            )?));
        }

        Ok(StoreBackend::Json(JsonStore::open(path)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Json(_) => "json",
            #[cfg(feature = "full")]
            StoreBackend::Rocks(_) => "rocksdb",
        }
    }
}

impl RecordStore for StoreBackend {
    fn upsert(&self, key: &str, record: &StoredRecord) -> ItoResult<()> {
        match self {
            StoreBackend::Memory(s) => s.upsert(key, record),
            StoreBackend::Json(s) => s.upsert(key, record),
            #[cfg(feature = "full")]
            StoreBackend::Rocks(s) => s.upsert(key, record),
        }
    }

    fn get(&self, key: &str) -> ItoResult<Option<StoredRecord>> {
        match self {
            StoreBackend::Memory(s) => s.get(key),
            StoreBackend::Json(s) => s.get(key),
            #[cfg(feature = "full")]
            StoreBackend::Rocks(s) => s.get(key),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> ItoResult<Vec<(String, StoredRecord)>> {
        match self {
            StoreBackend::Memory(s) => s.scan_prefix(prefix),
            StoreBackend::Json(s) => s.scan_prefix(prefix),
            #[cfg(feature = "full")]
            StoreBackend::Rocks(s) => s.scan_prefix(prefix),
        }
    }

    fn delete_where(
        &self,
        prefix: &str,
        pred: &dyn Fn(&str, &StoredRecord) -> bool,
    ) -> ItoResult<usize> {
        match self {
            StoreBackend::Memory(s) => s.delete_where(prefix, pred),
            StoreBackend::Json(s) => s.delete_where(prefix, pred),
            #[cfg(feature = "full")]
            StoreBackend::Rocks(s) => s.delete_where(prefix, pred),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(value: u64) -> StoredRecord {
        StoredRecord::Checkpoint { value }
    }

    fn report(byte: u8) -> StoredRecord {
        StoredRecord::Report(StoredReport {
            bytes: vec![byte; 4],
            fetched_at: 100,
        })
    }

    #[test]
    fn memory_scan_is_prefix_bounded_and_ordered() {
        let store = MemoryStore::new();
        store.upsert("report/b", &report(2)).unwrap();
        store.upsert("report/a", &report(1)).unwrap();
        store.upsert("session/x", &checkpoint(0)).unwrap();
        store.upsert("reportz", &report(9)).unwrap();

        let keys: Vec<String> = store
            .scan_prefix(REPORT_PREFIX)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["report/a", "report/b"]);
    }

    #[test]
    fn delete_where_only_touches_matches() {
        let store = MemoryStore::new();
        store.upsert("report/a", &report(1)).unwrap();
        store.upsert("report/b", &report(2)).unwrap();
        store.upsert(CHECKPOINT_KEY, &checkpoint(5)).unwrap();

        let deleted = store
            .delete_where(REPORT_PREFIX, &|k, _| k.ends_with('a'))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("report/a").unwrap().is_none());
        assert!(store.get("report/b").unwrap().is_some());
        assert_eq!(store.checkpoint().unwrap(), 5);
    }

    #[test]
    fn checkpoint_defaults_to_zero() {
        assert_eq!(MemoryStore::new().checkpoint().unwrap(), 0);
    }

    #[test]
    fn ratchet_record_roundtrip_through_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let mut state = RatchetState::new(8);
        state.tick().unwrap();
        let key = ratchet_key(state.id());

        {
            let store = JsonStore::open(&path).unwrap();
            store
                .upsert(&key, &StoredRecord::Ratchet(state.clone()))
                .unwrap();
        }

        let reopened = JsonStore::open(&path).unwrap();
        let mut restored = reopened.ratchets().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id(), state.id());
        assert_eq!(restored[0].tick_index(), 1);
        assert_eq!(restored[0].tick().unwrap(), state.tick().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn json_store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        // Left behind by an interrupted write, world-readable
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, b"{}").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = JsonStore::open(&path).unwrap();
        store
            .upsert(
                "ratchet/00000000000000000001-a",
                &StoredRecord::Ratchet(RatchetState::new(4)),
            )
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn json_store_persists_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store = JsonStore::open(&path).unwrap();
        store.upsert("report/a", &report(1)).unwrap();
        store.upsert("report/b", &report(2)).unwrap();
        store.delete_where(REPORT_PREFIX, &|_, _| true).unwrap();
        drop(store);

        let reopened = JsonStore::open(&path).unwrap();
        assert!(reopened.reports().unwrap().is_empty());
    }

    #[test]
    fn json_store_rolls_back_on_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // The store path is a directory, so the final rename fails
        let path = dir.path().join("records.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let store = JsonStore {
            path: path.clone(),
            entries: Mutex::new(BTreeMap::new()),
        };
        let err = store.upsert("report/a", &report(1)).unwrap_err();
        assert!(matches!(err, ItoError::StoreUnavailable(_)));
        assert!(store.get("report/a").unwrap().is_none());
    }

    #[test]
    fn report_bytes_serialize_as_base64() {
        let json = serde_json::to_string(&report(0xff)).unwrap();
        assert!(json.contains(r#""kind":"report""#));
        assert!(json.contains(r#""bytes":"/////w==""#));
        let back: StoredRecord = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, StoredRecord::Report(r) if r.bytes == vec![0xff; 4]));
    }

    #[test]
    fn backend_selection_by_path() {
        let dir = tempfile::tempdir().unwrap();

        let memory = StoreBackend::open(Path::new(":memory:")).unwrap();
        assert_eq!(memory.kind(), "memory");

        let json = StoreBackend::open(&dir.path().join("records.json")).unwrap();
        assert_eq!(json.kind(), "json");

        #[cfg(not(feature = "full"))]
        {
            let fallback = StoreBackend::open(&dir.path().join("records.db")).unwrap();
            assert_eq!(fallback.kind(), "json");
        }
    }

    #[test]
    fn report_keys_are_content_addressed() {
        assert_eq!(report_key(b"abc"), report_key(b"abc"));
        assert_ne!(report_key(b"abc"), report_key(b"abd"));
        assert!(report_key(b"abc").starts_with(REPORT_PREFIX));
    }
}
