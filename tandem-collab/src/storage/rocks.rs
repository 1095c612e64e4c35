//! RocksDB-backed operation log and snapshot cache.
//!
//! Column families:
//! - `snapshots`  — cached `Document` per document id (bincode, LZ4 compressed)
//! - `operations` — appended `OperationRecord`s (bincode, LZ4 compressed),
//!   keyed by `<id len:4 BE><id bytes><seq:8 BE>` so one document's log is a
//!   contiguous, ordered key range
//! - `metadata`   — per-document counters (bincode)

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tandem_core::{now_millis, Document, Timestamp};

use crate::protocol::OperationRecord;
use crate::snapshot::{SnapshotError, SnapshotStore};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
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

/// Per-document bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Sequence number the next appended operation gets
    pub next_seq: u64,
    /// Highest operation version appended
    pub last_version: u64,
    /// Version of the cached snapshot, if any
    pub snapshot_version: Option<u64>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DocumentMetadata {
    fn new(document_id: &str) -> Self {
        let now = now_millis();
        Self {
            document_id: document_id.to_string(),
            next_seq: 0,
            last_version: 0,
            snapshot_version: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn operation_count(&self) -> u64 {
        self.next_seq
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(String),
    /// Snapshot already exists
    AlreadyExists(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Document id too long to key (byte length)
    InvalidDocumentId(usize),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Snapshot already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::InvalidDocumentId(len) => {
                write!(f, "Document id of {len} bytes is too long")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for SnapshotError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists(id) => SnapshotError::AlreadyExists(id),
            other => SnapshotError::Backend(other.to_string()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(value)?))
}

fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    decode(&raw)
}

/// Durable operation log plus snapshot cache.
///
/// Appends for all documents are serialised through one lock so sequence
/// numbers are gap-free and log order matches append order.
pub struct OperationStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl OperationStore {
    /// Open (or create) the store at the configured path.
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

        log::info!("Opened operation store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        let cache_mb = (config.block_cache_size / (1024 * 1024)).max(1) as u64;
        match name {
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(cache_mb);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Operation log ────────────────────────────────────────────────

    /// Append a record to a document's log. Returns its sequence number.
    pub fn append_operation(
        &self,
        document_id: &str,
        record: &OperationRecord,
    ) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;

        let mut meta = self.load_metadata_or_new(document_id)?;
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.last_version = meta.last_version.max(record.version);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, Self::operation_key(document_id, seq)?, encode_compressed(record)?);
        batch.put_cf(&cf_meta, document_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;

        Ok(seq)
    }

    /// Every record of the document, in append order.
    pub fn history(&self, document_id: &str) -> Result<Vec<OperationRecord>, StoreError> {
        Ok(self
            .history_since(document_id, 0)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Records with sequence number `>= since_seq`, with their sequence numbers.
    pub fn history_since(
        &self,
        document_id: &str,
        since_seq: u64,
    ) -> Result<Vec<(u64, OperationRecord)>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = Self::operation_prefix(document_id)?;
        let start = Self::operation_key(document_id, since_seq)?;

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            records.push((u64::from_be_bytes(seq_buf), decode_compressed(&value)?));
        }

        Ok(records)
    }

    pub fn operation_count(&self, document_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .load_metadata(document_id)
            .map(|m| m.operation_count())
            .unwrap_or(0))
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    pub fn load_snapshot(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_compressed(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the snapshot, replacing any existing one.
    pub fn save_snapshot(
        &self,
        document_id: &str,
        snapshot: &Document,
    ) -> Result<DocumentMetadata, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        self.put_snapshot(document_id, snapshot)
    }

    /// Write the snapshot only if none exists yet.
    pub fn create_snapshot(
        &self,
        document_id: &str,
        snapshot: &Document,
    ) -> Result<DocumentMetadata, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        if self.load_snapshot(document_id)?.is_some() {
            return Err(StoreError::AlreadyExists(document_id.to_string()));
        }
        self.put_snapshot(document_id, snapshot)
    }

    fn put_snapshot(
        &self,
        document_id: &str,
        snapshot: &Document,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata_or_new(document_id)?;
        meta.snapshot_version = Some(snapshot.version);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, document_id.as_bytes(), encode_compressed(snapshot)?);
        batch.put_cf(&cf_meta, document_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;

        Ok(meta)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    fn load_metadata_or_new(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(document_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(document_id)),
            Err(e) => Err(e),
        }
    }

    /// Ids of every document with a log or snapshot.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
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

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn operation_prefix(document_id: &str) -> Result<Vec<u8>, StoreError> {
        let id = document_id.as_bytes();
        let mut prefix = Vec::with_capacity(4 + id.len());
        prefix.extend_from_slice(&id_length_prefix(id.len())?);
        prefix.extend_from_slice(id);
        Ok(prefix)
    }

    fn operation_key(document_id: &str, seq: u64) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::operation_prefix(document_id)?;
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }
}

/// Big-endian 32-bit length of a document id; longer ids cannot be keyed.
fn id_length_prefix(len: usize) -> Result<[u8; 4], StoreError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| StoreError::InvalidDocumentId(len))
}

#[async_trait]
impl SnapshotStore for OperationStore {
    async fn get(&self, document_id: &str) -> Result<Option<Document>, SnapshotError> {
        Ok(self.load_snapshot(document_id)?)
    }

    async fn create(&self, document_id: &str, initial: &Document) -> Result<(), SnapshotError> {
        self.create_snapshot(document_id, initial)?;
        Ok(())
    }

    async fn update(&self, document_id: &str, snapshot: &Document) -> Result<(), SnapshotError> {
        self.save_snapshot(document_id, snapshot)?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
