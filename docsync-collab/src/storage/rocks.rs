//! RocksDB-backed durable snapshot store.
//!
//! Column families:
//! - `documents`: one snapshot per document id (bincode, LZ4 compressed)
//!
//! Key: the document id's UTF-8 bytes. Every read-check-write (lazy
//! creation in `get`, `compare_and_set`) runs under the store's write
//! gate so two tasks in this process never interleave on one key.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use docsync_core::DocumentSnapshot;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use tokio::sync::Mutex;

use super::{SnapshotStore, StoreError};

const CF_DOCUMENTS: &str = "documents";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, snapshots are the only copy)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, no fsync).
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

/// Durable snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_gate: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_gate: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// All document ids currently stored.
    pub fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn load(&self, id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_snapshot(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let encoded = encode_snapshot(snapshot)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, snapshot.id.as_bytes(), encoded, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl SnapshotStore for RocksStore {
    async fn get(&self, id: &str) -> Result<DocumentSnapshot, StoreError> {
        if let Some(snapshot) = self.load(id)? {
            return Ok(snapshot);
        }

        let _gate = self.write_gate.lock().await;
        if let Some(snapshot) = self.load(id)? {
            return Ok(snapshot);
        }
        let created = DocumentSnapshot::empty(id);
        self.save(&created)?;
        log::debug!("Created document {id}");
        Ok(created)
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: &DocumentSnapshot,
    ) -> Result<bool, StoreError> {
        let _gate = self.write_gate.lock().await;
        let current_version = self.load(&next.id)?.map_or(0, |s| s.version);
        if current_version != expected_version {
            return Ok(false);
        }
        self.save(next)?;
        Ok(true)
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

fn encode_snapshot(snapshot: &DocumentSnapshot) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_snapshot(bytes: &[u8]) -> Result<DocumentSnapshot, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(snapshot)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn edited(base: &DocumentSnapshot, content: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            id: base.id.clone(),
            content: content.into(),
            version: base.version + 1,
            updated_at: base.updated_at + 1,
        }
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("docsync_data"));
        assert!(config.sync_writes);
        assert!(!StoreConfig::for_testing("x").sync_writes);
    }

    #[tokio::test]
    async fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.backend(), "rocksdb");
        assert!(store.document_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_creates_and_persists_default() {
        let (_dir, store) = open_temp();
        let snap = store.get("notes").await.unwrap();
        assert_eq!(snap.content, "");
        assert_eq!(snap.version, 0);
        assert_eq!(store.document_ids().unwrap(), vec!["notes".to_string()]);
        assert_eq!(store.get("notes").await.unwrap(), snap);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (_dir, store) = open_temp();
        let base = store.get("doc").await.unwrap();

        assert!(store.compare_and_set(0, &edited(&base, "first")).await.unwrap());
        assert!(!store.compare_and_set(0, &edited(&base, "stale")).await.unwrap());

        let current = store.get("doc").await.unwrap();
        assert_eq!(current.content, "first");
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            let base = store.get("durable").await.unwrap();
            let content = "unicode ✓ 😀 ".repeat(500);
            assert!(store.compare_and_set(0, &edited(&base, &content)).await.unwrap());
        }

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let snap = store.get("durable").await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.content, "unicode ✓ 😀 ".repeat(500));
    }

    #[tokio::test]
    async fn test_documents_isolated() {
        let (_dir, store) = open_temp();
        let a = store.get("a").await.unwrap();
        store.compare_and_set(0, &edited(&a, "alpha")).await.unwrap();
        let b = store.get("b").await.unwrap();
        assert_eq!(b.content, "");
        assert_eq!(b.id, "b");

        let mut ids = store.document_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_snapshot(&[0xFF, 0x00, 0x01]).is_err());
    }
}
