//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: one row per room document, key `room_id \0 doc_name`,
//!   value an LZ4-compressed JSON [`PersistedSnapshot`].
//!
//! Rows are small and point-read once per room creation, so the column family
//! is tuned for point lookups with a bloom filter and block cache.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{PersistedSnapshot, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";

/// Separates room id and document name in row keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

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

/// RocksDB snapshot store.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors = vec![ColumnFamilyDescriptor::new(
            CF_SNAPSHOTS,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Every `(room_id, doc_name)` with a stored row.
    pub fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let cf = self.cf()?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(parts) = split_key(&key) {
                out.push(parts);
            }
        }
        Ok(out)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_SNAPSHOTS}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn load_latest(&self, room_id: &str, doc_name: &str) -> Result<Option<PersistedSnapshot>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(&cf, row_key(room_id, doc_name))? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                PersistedSnapshot::from_json_bytes(&json).map(Some)
            }
            None => Ok(None),
        }
    }

    fn upsert(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let compressed = lz4_flex::compress_prepend_size(&snapshot.to_json_bytes()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(
            &cf,
            row_key(&snapshot.room_id, &snapshot.doc_name),
            &compressed,
            &write_opts,
        )?;
        Ok(())
    }

    fn delete(&self, room_id: &str, doc_name: &str) -> Result<bool, StoreError> {
        let cf = self.cf()?;
        let key = row_key(room_id, doc_name);
        let existed = self.db.get_cf(&cf, &key)?.is_some();
        if existed {
            self.db.delete_cf(&cf, &key)?;
        }
        Ok(existed)
    }
}

fn row_key(room_id: &str, doc_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + 1 + doc_name.len());
    key.extend_from_slice(room_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(doc_name.as_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(String, String)> {
    let sep = key.iter().position(|b| *b == KEY_SEPARATOR)?;
    let room = std::str::from_utf8(&key[..sep]).ok()?;
    let doc = std::str::from_utf8(&key[sep + 1..]).ok()?;
    Some((room.to_string(), doc.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
