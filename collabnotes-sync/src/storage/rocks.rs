//! RocksDB-backed snapshot store for note documents.
//!
//! Column families:
//! - `snapshots` — full CRDT state blobs (LZ4 compressed), keyed by note id
//! - `metadata`  — bincode-encoded [`SnapshotMetadata`], same key
//!
//! A snapshot and its metadata are always written in one `WriteBatch`, so a
//! reader never observes a blob without its attribution or vice versa.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

use crate::auth::Identity;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collabnotes_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Attribution stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Owning note id (the suffix of `note:<id>`)
    pub note_id: String,
    /// User id of the identity that triggered the flush
    pub modified_by: String,
    /// Display name of that identity at flush time
    pub modified_by_name: String,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last flush timestamp (seconds since epoch)
    pub updated_at: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
}

impl SnapshotMetadata {
    fn new(note_id: &str) -> Self {
        let now = unix_now();
        Self {
            note_id: note_id.to_string(),
            modified_by: String::new(),
            modified_by_name: String::new(),
            created_at: now,
            updated_at: now,
            snapshot_size: 0,
            compressed_size: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// No snapshot exists for the note — a genuinely new document
    #[error("No snapshot for note: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl StoreError {
    /// Whether this error means "nothing persisted yet" rather than a
    /// failure reading something that should exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed snapshot store.
pub struct SnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open the snapshot store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Column family options: point-lookup heavy, LZ4 at the table level.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Save a snapshot with attribution, atomically.
    ///
    /// The blob is the full CRDT state (`encode_state_as_update_v1`);
    /// overwrites any previous snapshot in place.
    pub fn save_snapshot(
        &self,
        note_id: &str,
        snapshot: &[u8],
        modified_by: &Identity,
    ) -> Result<SnapshotMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(note_id)
            .unwrap_or_else(|_| SnapshotMetadata::new(note_id));
        meta.modified_by = modified_by.user_id.clone();
        meta.modified_by_name = modified_by.display_name.clone();
        meta.updated_at = unix_now();
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;

        // Atomic batch write: snapshot + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, note_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, note_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a snapshot (LZ4 decompressed).
    ///
    /// Returns the raw CRDT state for `apply_update`, or
    /// [`StoreError::NotFound`] for a note that was never flushed.
    pub fn load_snapshot(&self, note_id: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;

        match self.db.get_cf(&cf, note_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(note_id.to_string())),
        }
    }

    /// Load snapshot attribution metadata.
    pub fn load_metadata(&self, note_id: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;

        match self.db.get_cf(&cf, note_id.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(note_id.to_string())),
        }
    }

    /// Check whether a snapshot exists.
    pub fn snapshot_exists(&self, note_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, note_id.as_bytes())?.is_some())
    }

    /// List all note ids with a persisted snapshot.
    pub fn list_notes(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut note_ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Deserialization("Invalid note id key".into()))?;
            note_ids.push(id);
        }

        Ok(note_ids)
    }

    /// Delete a note's snapshot and metadata.
    pub fn delete_snapshot(&self, note_id: &str) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, note_id.as_bytes());
        batch.delete_cf(&cf_meta, note_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush of RocksDB memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
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

    fn editor() -> Identity {
        Identity {
            user_id: "user-alice".to_string(),
            display_name: "Alice".to_string(),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> SnapshotStore {
        SnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let data = b"note body with enough repeated text text text to compress".to_vec();
        let meta = store.save_snapshot("abc1234567", &data, &editor()).unwrap();

        assert_eq!(meta.note_id, "abc1234567");
        assert_eq!(meta.modified_by, "user-alice");
        assert_eq!(meta.modified_by_name, "Alice");
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size > 0);
        assert!(meta.updated_at >= meta.created_at);

        let loaded = store.load_snapshot("abc1234567").unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_snapshot_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let err = store.load_snapshot("missing123").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let first = store.save_snapshot("abc1234567", b"v1", &editor()).unwrap();
        let second = store
            .save_snapshot(
                "abc1234567",
                b"v2",
                &Identity {
                    user_id: "user-bob".to_string(),
                    display_name: "Bob".to_string(),
                },
            )
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.modified_by, "user-bob");
        assert_eq!(store.load_snapshot("abc1234567").unwrap(), b"v2");
    }

    #[test]
    fn test_snapshot_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert!(!store.snapshot_exists("abc1234567").unwrap());
        store.save_snapshot("abc1234567", b"data", &editor()).unwrap();
        assert!(store.snapshot_exists("abc1234567").unwrap());
    }

    #[test]
    fn test_list_notes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for id in ["note-a-0001", "note-b-0002", "note-c-0003"] {
            store.save_snapshot(id, b"data", &editor()).unwrap();
        }

        let listed = store.list_notes().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&"note-b-0002".to_string()));
    }

    #[test]
    fn test_delete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.save_snapshot("abc1234567", b"data", &editor()).unwrap();
        store.delete_snapshot("abc1234567").unwrap();

        assert!(!store.snapshot_exists("abc1234567").unwrap());
        assert!(store.load_snapshot("abc1234567").is_err());
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let store = SnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot("abc1234567", b"persisted", &editor()).unwrap();
        }

        let store = SnapshotStore::open(StoreConfig::for_testing(&path)).unwrap();
        let meta = store.load_metadata("abc1234567").unwrap();
        assert_eq!(meta.modified_by, "user-alice");
        assert_eq!(store.load_snapshot("abc1234567").unwrap(), b"persisted");
    }

    #[test]
    fn test_large_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // 1MB of uniform data compresses extremely well
        let data = vec![42u8; 1_000_000];
        let meta = store.save_snapshot("abc1234567", &data, &editor()).unwrap();
        assert_eq!(meta.snapshot_size, 1_000_000);
        assert!(meta.compressed_size < 100_000);

        let loaded = store.load_snapshot("abc1234567").unwrap();
        assert_eq!(loaded.len(), 1_000_000);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("abc".into());
        assert!(err.to_string().contains("abc"));

        let err = StoreError::Database("boom".into());
        assert!(err.to_string().contains("Database error"));
    }
}
