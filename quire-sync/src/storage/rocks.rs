//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — one LZ4-compressed [`DocumentRecord`] per document
//! - `oplog`     — one [`OpLogEntry`] per commit, keyed by
//!   `<id len: u16 BE><id bytes><version: u64 BE>`
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::oplog::{self, OpLogEntry};
use super::StoreError;
use crate::delta::Delta;
use crate::document::{DocumentId, Snapshot};

const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every op-log append and record write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Persisted document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub content: Delta,
    pub version: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentRecord {
    pub fn new(snapshot: Snapshot) -> Self {
        let now = now_secs();
        Self {
            content: snapshot.content,
            version: snapshot.version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same record, moved forward to `snapshot`.
    pub fn advance(&self, snapshot: Snapshot) -> Self {
        Self {
            content: snapshot.content,
            version: snapshot.version,
            created_at: self.created_at,
            updated_at: now_secs(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            version: self.version,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// What a document actor needs to rebuild its state.
#[derive(Debug, Clone, Default)]
pub struct Recovered {
    /// Last written record, if any
    pub record: Option<DocumentRecord>,
    /// Verified entries after the record's version, contiguous
    pub entries: Vec<OpLogEntry>,
    /// Entries before the record still retained (for rebasing history)
    pub history: Vec<OpLogEntry>,
    /// Rows that failed to decode or verify
    pub skipped: usize,
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, writers serialised per document)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
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
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // records are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // small appends, range-scanned per document
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Records ──────────────────────────────────────────────────────

    /// Write a record and drop op-log entries up to `compact_through`,
    /// atomically. Returns how many entries were removed.
    pub fn save_record(
        &self,
        id: &DocumentId,
        record: &DocumentRecord,
        compact_through: Option<u64>,
    ) -> Result<u64, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_oplog = self.cf(CF_OPLOG)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, id.as_bytes(), record.encode()?);

        let mut removed = 0u64;
        if let Some(through) = compact_through {
            let prefix = key_prefix(id)?;
            let end_key = oplog_key(id, through.saturating_add(1))?;
            let iter = self.db.iterator_cf(
                cf_oplog,
                IteratorMode::From(&prefix, Direction::Forward),
            );
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(&prefix) || key.as_ref() >= end_key.as_slice() {
                    break;
                }
                batch.delete_cf(cf_oplog, &key);
                removed += 1;
            }
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(removed)
    }

    pub fn load_record(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => DocumentRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, id: &DocumentId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?.is_some())
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(DocumentId::from(id));
        }
        Ok(ids)
    }

    /// Delete a document's record and its whole op log.
    pub fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_oplog = self.cf(CF_OPLOG)?;
        let prefix = key_prefix(id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, id.as_bytes());
        let iter = self.db.iterator_cf(
            cf_oplog,
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf_oplog, &key);
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    // ─── Op log ───────────────────────────────────────────────────────

    /// Append one committed operation.
    pub fn append(&self, entry: &OpLogEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let key = oplog_key(&entry.document_id, entry.version)?;
        self.db.put_cf_opt(cf, key, entry.encode()?, &self.write_options())?;
        Ok(())
    }

    /// Drop op-log entries newer than `version`. Used after a recovery that
    /// stopped early, so stale entries never follow fresh commits.
    pub fn discard_after(&self, id: &DocumentId, version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = key_prefix(id)?;
        let start = oplog_key(id, version.saturating_add(1))?;

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        let iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if version_of(&prefix, &key).is_none() {
                break;
            }
            batch.delete_cf(cf, &key);
            removed += 1;
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(removed)
    }

    /// Raw op-log rows for `id` with version >= `since`, in version order.
    pub fn load_entries_since(
        &self,
        id: &DocumentId,
        since: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = key_prefix(id)?;
        let start = oplog_key(id, since)?;

        let mut rows = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            match version_of(&prefix, &key) {
                Some(version) => rows.push((version, value.to_vec())),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Read record and op log from one consistent snapshot.
    pub fn recover(&self, id: &DocumentId) -> Result<Recovered, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_oplog = self.cf(CF_OPLOG)?;
        let prefix = key_prefix(id)?;
        let view = self.db.snapshot();

        let record = match view.get_cf(cf_docs, id.as_bytes())? {
            Some(bytes) => Some(DocumentRecord::decode(&bytes)?),
            None => None,
        };
        let base = record.as_ref().map_or(0, |r| r.version);

        let mut before = Vec::new();
        let mut after = Vec::new();
        let iter = view.iterator_cf(cf_oplog, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(version) = version_of(&prefix, &key) else {
                break;
            };
            if version <= base {
                before.push((version, value.to_vec()));
            } else {
                after.push((version, value.to_vec()));
            }
        }

        let (entries, skipped_after) = oplog::recover_entries(id, base, after);
        let history_start = before.first().map_or(base, |(v, _)| v.saturating_sub(1));
        let (mut history, _) = oplog::recover_entries(id, history_start, before);
        // keep only a run that ends right at the record
        if history.last().map(|e| e.version) != Some(base) {
            history.clear();
        }

        Ok(Recovered {
            record,
            entries,
            history,
            skipped: skipped_after,
        })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn sync_writes(&self) -> bool {
        self.config.sync_writes
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

/// `<id len: u16 BE><id bytes>`
fn key_prefix(id: &DocumentId) -> Result<Vec<u8>, StoreError> {
    let bytes = id.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| StoreError::InvalidKey(bytes.len()))?;
    let mut key = Vec::with_capacity(2 + bytes.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}

/// Prefix followed by the big-endian version.
fn oplog_key(id: &DocumentId, version: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = key_prefix(id)?;
    key.extend_from_slice(&version.to_be_bytes());
    Ok(key)
}

fn version_of(prefix: &[u8], key: &[u8]) -> Option<u64> {
    if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[prefix.len()..]);
    Some(u64::from_be_bytes(buf))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
