//! RocksDB-backed record store.
//!
//! Column families:
//! - `documents`: document header: full state, state vector, lock, metadata
//! - `updates`  : append-only update log, keyed by `doc_id ‖ clock (BE)`
//! - `snapshots`: named checkpoints, keyed by `doc_id ‖ seq (BE)`
//! - `sessions` : ended session records, keyed by session id
//!
//! Every value is a bincode record compressed with LZ4. Multi-key changes go
//! through a [`StoreBatch`] so they land in one atomic `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_SNAPSHOTS, CF_SESSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plexus_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub held: bool,
    pub holder: Option<String>,
    /// Milliseconds since epoch
    pub acquired_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub element_count: u64,
    pub total_updates: u64,
    pub last_edit_at: u64,
    pub last_edit_by: Option<String>,
    pub created_at: u64,
    pub compactions: u64,
}

/// Header record of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: Uuid,
    pub state_vector: Vec<u8>,
    pub full_state: Vec<u8>,
    pub lock: LockState,
    pub metadata: DocumentMetadata,
    /// Clock of the last appended update
    pub last_clock: u64,
    /// Sequence of the last snapshot taken
    pub snapshot_seq: u64,
}

impl DocumentRecord {
    pub fn new(document_id: Uuid, full_state: Vec<u8>, state_vector: Vec<u8>, now: u64) -> Self {
        Self {
            document_id,
            state_vector,
            full_state,
            lock: LockState::default(),
            metadata: DocumentMetadata { created_at: now, last_edit_at: now, ..Default::default() },
            last_clock: 0,
            snapshot_seq: 0,
        }
    }
}

/// One entry of the append-only update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub clock: u64,
    pub bytes: Vec<u8>,
    pub timestamp: u64,
    pub client_id: Option<String>,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub seq: u64,
    pub bytes: Vec<u8>,
    pub state_vector: Vec<u8>,
    pub created_at: u64,
    pub created_by: String,
    pub description: String,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    SnapshotNotFound(Uuid),
    /// The advisory lock is held by someone else
    Locked { holder: String },
    /// Stored or supplied CRDT bytes could not be integrated
    InvalidUpdate(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SnapshotNotFound(id) => write!(f, "Snapshot not found: {id}"),
            StoreError::Locked { holder } => write!(f, "Document locked by {holder}"),
            StoreError::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<plexus_core::document::DocumentError> for StoreError {
    fn from(e: plexus_core::document::DocumentError) -> Self {
        StoreError::InvalidUpdate(e.to_string())
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

// ─── Store ────────────────────────────────────────────────────────────

/// RocksDB-backed store for document headers, update logs, snapshots and
/// session records.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 blocks
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_SESSIONS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES | CF_SNAPSHOTS => {
                // prefix-scanned by document id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get_document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn document_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.keys_as_ids(CF_DOCUMENTS)
    }

    /// The update log of a document in clock order.
    pub fn updates(&self, doc_id: Uuid) -> Result<Vec<UpdateRecord>, StoreError> {
        self.scan_prefixed(CF_UPDATES, doc_id)
    }

    /// Snapshots of a document, oldest first.
    pub fn snapshots(&self, doc_id: Uuid) -> Result<Vec<SnapshotRecord>, StoreError> {
        self.scan_prefixed(CF_SNAPSHOTS, doc_id)
    }

    pub fn get_session<T: DeserializeOwned>(&self, session_id: Uuid) -> Result<Option<T>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn session_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.keys_as_ids(CF_SESSIONS)
    }

    fn scan_prefixed<T: DeserializeOwned>(&self, cf_name: &str, doc_id: Uuid) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start_key = Self::seq_key(doc_id, 0);
        let mut records = Vec::new();

        let iter = self.db.iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            records.push(decode_record(&value)?);
        }
        Ok(records)
    }

    fn keys_as_ids(&self, cf_name: &str) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Start an atomic multi-key write.
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch { store: self, batch: WriteBatch::default() }
    }

    pub fn write(&self, batch: StoreBatch<'_>) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch.batch, &write_opts)?;
        Ok(())
    }

    pub fn put_document(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut batch = self.batch();
        batch.put_document(record)?;
        self.write(batch)
    }

    pub fn put_session<T: Serialize>(&self, session_id: Uuid, record: &T) -> Result<(), StoreError> {
        let mut batch = self.batch();
        batch.put_session(session_id, record)?;
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn seq_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

/// Pending atomic write against a [`DocumentStore`].
pub struct StoreBatch<'a> {
    store: &'a DocumentStore,
    batch: WriteBatch,
}

impl StoreBatch<'_> {
    pub fn put_document(&mut self, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_DOCUMENTS)?;
        self.batch.put_cf(cf, record.document_id.as_bytes(), encode_record(record)?);
        Ok(())
    }

    pub fn put_update(&mut self, doc_id: Uuid, record: &UpdateRecord) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_UPDATES)?;
        self.batch.put_cf(cf, DocumentStore::seq_key(doc_id, record.clock), encode_record(record)?);
        Ok(())
    }

    pub fn delete_update(&mut self, doc_id: Uuid, clock: u64) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_UPDATES)?;
        self.batch.delete_cf(cf, DocumentStore::seq_key(doc_id, clock));
        Ok(())
    }

    pub fn put_snapshot(&mut self, doc_id: Uuid, record: &SnapshotRecord) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_SNAPSHOTS)?;
        self.batch.put_cf(cf, DocumentStore::seq_key(doc_id, record.seq), encode_record(record)?);
        Ok(())
    }

    pub fn delete_snapshot(&mut self, doc_id: Uuid, seq: u64) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_SNAPSHOTS)?;
        self.batch.delete_cf(cf, DocumentStore::seq_key(doc_id, seq));
        Ok(())
    }

    pub fn put_session<T: Serialize>(&mut self, session_id: Uuid, record: &T) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_SESSIONS)?;
        self.batch.put_cf(cf, session_id.as_bytes(), encode_record(record)?);
        Ok(())
    }

    pub fn delete_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_SESSIONS)?;
        self.batch.delete_cf(cf, session_id.as_bytes());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn update(clock: u64, byte: u8) -> UpdateRecord {
        UpdateRecord {
            clock,
            bytes: vec![byte; 32],
            timestamp: clock * 10,
            client_id: Some("alice".into()),
            origin: "remote".into(),
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.document_ids().unwrap().is_empty());
    }

    #[test]
    fn test_document_roundtrip() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        assert_eq!(store.get_document(id).unwrap(), None);

        let record = DocumentRecord::new(id, vec![0, 0], vec![0], 1_000);
        store.put_document(&record).unwrap();
        assert_eq!(store.get_document(id).unwrap(), Some(record));
        assert_eq!(store.document_ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_updates_scan_in_clock_order_and_isolated() {
        let (_dir, store) = open_temp();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut batch = store.batch();
        for clock in [3, 1, 2, 256] {
            batch.put_update(a, &update(clock, clock as u8)).unwrap();
        }
        batch.put_update(b, &update(1, 99)).unwrap();
        assert_eq!(batch.len(), 5);
        store.write(batch).unwrap();

        let clocks: Vec<u64> = store.updates(a).unwrap().iter().map(|u| u.clock).collect();
        assert_eq!(clocks, vec![1, 2, 3, 256]);
        assert_eq!(store.updates(b).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_is_atomic_across_families() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        let mut record = DocumentRecord::new(id, vec![1], vec![2], 0);

        let mut batch = store.batch();
        batch.put_update(id, &update(1, 1)).unwrap();
        batch.put_update(id, &update(2, 2)).unwrap();
        record.last_clock = 2;
        batch.put_document(&record).unwrap();
        store.write(batch).unwrap();

        let mut batch = store.batch();
        batch.delete_update(id, 1).unwrap();
        record.full_state = vec![1, 1];
        batch.put_document(&record).unwrap();
        store.write(batch).unwrap();

        assert_eq!(store.updates(id).unwrap().len(), 1);
        assert_eq!(store.get_document(id).unwrap().unwrap().full_state, vec![1, 1]);
    }

    #[test]
    fn test_snapshots_and_sessions() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        let mut batch = store.batch();
        for seq in 1..=3 {
            batch
                .put_snapshot(
                    id,
                    &SnapshotRecord {
                        id: Uuid::new_v4(),
                        seq,
                        bytes: vec![seq as u8],
                        state_vector: vec![],
                        created_at: seq,
                        created_by: "ops".into(),
                        description: format!("v{seq}"),
                    },
                )
                .unwrap();
        }
        batch.delete_snapshot(id, 1).unwrap();
        store.write(batch).unwrap();
        let seqs: Vec<u64> = store.snapshots(id).unwrap().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3]);

        let session = Uuid::new_v4();
        store.put_session(session, &("ended".to_string(), 3u32)).unwrap();
        let loaded: Option<(String, u32)> = store.get_session(session).unwrap();
        assert_eq!(loaded, Some(("ended".to_string(), 3)));
        assert_eq!(store.session_ids().unwrap(), vec![session]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
            store.put_document(&DocumentRecord::new(id, vec![7], vec![8], 5)).unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(store.get_document(id).unwrap().unwrap().full_state, vec![7]);
    }

    #[test]
    fn test_corrupt_value_reports_error() {
        assert!(matches!(
            decode_record::<DocumentRecord>(&[1, 2, 3]),
            Err(StoreError::CompressionError(_))
        ));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Locked { holder: "compaction".into() };
        assert_eq!(err.to_string(), "Document locked by compaction");
    }
}
