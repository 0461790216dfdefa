//! RocksDB-backed scene store.
//!
//! Column families:
//! - `scenes`: Full scene as JSON, LZ4 compressed, keyed by scene id
//! - `metadata`: Scene metadata (bincode: version, element count, sizes)
//!
//! A scene and its metadata are always written in one `WriteBatch`, so a
//! crash never leaves metadata describing a scene that was not stored.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SceneStorage, StoreError};
use crate::protocol::Scene;

const CF_SCENES: &str = "scenes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SCENES, CF_METADATA];

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
            path: PathBuf::from("scene_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
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

/// Metadata stored next to each scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub scene_id: String,
    /// Version of the last saved scene
    pub version: u64,
    pub element_count: u64,
    /// Uncompressed JSON size in bytes
    pub raw_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
    /// Number of saves since creation
    pub save_count: u64,
}

impl SceneMetadata {
    fn new(scene_id: &str) -> Self {
        let now = unix_now();
        Self {
            scene_id: scene_id.to_string(),
            version: 0,
            element_count: 0,
            raw_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            save_count: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Aggregate figures over every stored scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub scene_count: u64,
    pub element_count: u64,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

impl StoreStats {
    /// Compressed over raw size, 1.0 when nothing is stored.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.raw_bytes as f64
        }
    }
}

/// RocksDB scene store.
pub struct SceneDb {
    /// Single-threaded mode, callers serialize through the scene lock
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SceneDb {
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
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened scene store at {}", config.path.display());
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
            CF_SCENES => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Save a full scene (JSON, LZ4 compressed) together with its metadata.
    pub fn save_scene(&self, scene_id: &str, scene: &Scene) -> Result<SceneMetadata, StoreError> {
        let cf_scenes = self.cf(CF_SCENES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(scene)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .metadata(scene_id)?
            .unwrap_or_else(|| SceneMetadata::new(scene_id));
        meta.version = scene.version;
        meta.element_count = scene.elements.len() as u64;
        meta.raw_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();
        meta.save_count += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_scenes, scene_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, scene_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved scene {scene_id} v{} ({} elements, {} -> {} bytes)",
            meta.version,
            meta.element_count,
            meta.raw_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a scene, `None` if absent.
    pub fn load_scene(&self, scene_id: &str) -> Result<Option<Scene>, StoreError> {
        let cf = self.cf(CF_SCENES)?;
        let Some(compressed) = self.db.get_cf(&cf, scene_id.as_bytes())? else {
            return Ok(None);
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let scene = serde_json::from_slice(&json)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(scene))
    }

    /// Load scene metadata, `None` if the scene was never saved.
    pub fn metadata(&self, scene_id: &str) -> Result<Option<SceneMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, scene_id.as_bytes())? {
            Some(bytes) => SceneMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn scene_exists(&self, scene_id: &str) -> Result<bool, StoreError> {
        Ok(self.metadata(scene_id)?.is_some())
    }

    /// Ids of every stored scene, in key order.
    pub fn scene_ids(&self) -> Result<Vec<String>, StoreError> {
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

    /// Sum the metadata of every stored scene.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut stats = StoreStats::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = SceneMetadata::decode(&value)?;
            stats.scene_count += 1;
            stats.element_count += meta.element_count;
            stats.raw_bytes += meta.raw_size;
            stats.compressed_bytes += meta.compressed_size;
        }
        Ok(stats)
    }

    /// Delete a scene and its metadata.
    pub fn delete_scene(&self, scene_id: &str) -> Result<(), StoreError> {
        let cf_scenes = self.cf(CF_SCENES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_scenes, scene_id.as_bytes());
        batch.delete_cf(&cf_meta, scene_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SceneStorage for SceneDb {
    fn load(&self, scene_id: &str) -> Result<Option<Scene>, StoreError> {
        self.load_scene(scene_id)
    }

    fn save(&self, scene_id: &str, scene: &Scene) -> Result<(), StoreError> {
        self.save_scene(scene_id, scene).map(|_| ())
    }

    fn list_scenes(&self) -> Result<Vec<String>, StoreError> {
        self.scene_ids()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
