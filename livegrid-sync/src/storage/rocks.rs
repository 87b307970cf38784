//! RocksDB-backed record store.
//!
//! Column families:
//! - `records`: one entry per record, key = id (big-endian u64) so the
//!   natural key order is id order; value = LZ4-compressed JSON record
//! - `meta`   : `last_id` and `count` counters (big-endian u64)
//!
//! Writes that read before writing (`insert`, `update`) are serialised by a
//! writer lock and committed as one `WriteBatch`, so the version increment
//! and the data write land together.
//!
//! Reference: Kleppmann: DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use livegrid_core::{Record, RecordData, RecordId};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{RecordStore, StoreError};

const CF_RECORDS: &str = "records";
const CF_META: &str = "meta";

const KEY_LAST_ID: &[u8] = b"last_id";
const KEY_COUNT: &[u8] = b"count";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
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
            path: PathBuf::from("livegrid_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serialises read-modify-write sequences.
    writer: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors = [CF_RECORDS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options(name, &config, &cache)))
            .collect::<Vec<_>>();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            writer: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4-compressed
            CF_RECORDS => opts.set_compression_type(DBCompressionType::None),
            CF_META => opts.optimize_for_point_lookup(config.block_cache_size as u64),
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush_cf(self.cf(CF_RECORDS)?)?;
        self.db.flush_cf(self.cf(CF_META)?)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_counter(&self, key: &[u8]) -> Result<u64, StoreError> {
        let value = self.db.get_cf(self.cf(CF_META)?, key)?;
        Ok(value.as_deref().map(decode_u64).unwrap_or(0))
    }

    fn load(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        match self.db.get_cf(self.cf(CF_RECORDS)?, id.to_be_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl RecordStore for RocksStore {
    fn insert(&self, data: RecordData, now: DateTime<Utc>) -> Result<Record, StoreError> {
        let mut records = self.insert_batch(vec![data], now)?;
        records
            .pop()
            .ok_or_else(|| StoreError::DatabaseError("insert produced no record".into()))
    }

    fn insert_batch(
        &self,
        rows: Vec<RecordData>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        let _guard = self.lock_writer();
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut last_id = self.read_counter(KEY_LAST_ID)?;
        let count = self.read_counter(KEY_COUNT)?;

        let mut batch = WriteBatch::default();
        let mut inserted = Vec::with_capacity(rows.len());
        for data in rows {
            last_id += 1;
            let record = Record::new_created(last_id, data, now);
            batch.put_cf(cf_records, record.id.to_be_bytes(), encode_record(&record)?);
            inserted.push(record);
        }
        batch.put_cf(cf_meta, KEY_LAST_ID, last_id.to_be_bytes());
        batch.put_cf(cf_meta, KEY_COUNT, (count + inserted.len() as u64).to_be_bytes());
        self.write(batch)?;

        log::debug!("Inserted {} records (last id {last_id})", inserted.len());
        Ok(inserted)
    }

    fn update(
        &self,
        id: RecordId,
        patch: &RecordData,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        let _guard = self.lock_writer();
        let current = self.load(id)?.ok_or(StoreError::NotFound(id))?;
        let next = current.patched(patch, now);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_RECORDS)?, id.to_be_bytes(), encode_record(&next)?);
        self.write(batch)?;

        Ok(next)
    }

    fn scan_after(&self, cursor: Option<RecordId>, limit: usize) -> Result<Vec<Record>, StoreError> {
        let start = match cursor {
            None => 0,
            Some(cursor) => match cursor.checked_add(1) {
                Some(start) => start,
                None => return Ok(Vec::new()),
            },
        };
        let start_key = start.to_be_bytes();
        let iter = self.db.iterator_cf(
            self.cf(CF_RECORDS)?,
            IteratorMode::From(&start_key, Direction::Forward),
        );

        let mut rows = Vec::with_capacity(limit.min(1024));
        for item in iter.take(limit) {
            let (_, value) = item?;
            rows.push(decode_record(&value)?);
        }
        Ok(rows)
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.read_counter(KEY_COUNT)
    }
}

fn encode_record(record: &Record) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(record)?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_record(bytes: &[u8]) -> Result<Record, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
