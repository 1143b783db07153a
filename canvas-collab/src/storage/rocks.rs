//! RocksDB-backed canvas store.
//!
//! Column families:
//! - `snapshots` — Full cell buffer (LZ4 compressed), one key
//! - `pixels`    — Committed writes since the snapshot (keyed by sequence, big-endian)
//! - `metadata`  — Dimensions and snapshot bookkeeping (bincode)
//!
//! Recovery loads the snapshot and replays every pixel at or after
//! `snapshot_sequence`. Compaction deletes the pixels a snapshot covers.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_PIXELS: &str = "pixels";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PIXELS, CF_METADATA];

/// Key of the single canvas record in `snapshots` and `metadata`.
const CANVAS_KEY: &[u8] = b"canvas";

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
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
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

    /// Create config for testing (small caches).
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

/// Canvas metadata stored alongside the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasMetadata {
    pub width: u32,
    pub height: u32,
    /// First pixel sequence not covered by the snapshot
    pub snapshot_sequence: u64,
    /// Number of snapshots taken
    pub snapshot_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last snapshot timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl CanvasMetadata {
    fn new(width: u32, height: u32) -> Self {
        let now = unix_now();
        Self {
            width,
            height,
            snapshot_sequence: 0,
            snapshot_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
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

/// One logged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPixel {
    pub x: u32,
    pub y: u32,
    pub color: u8,
}

impl StoredPixel {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (pixel, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(pixel)
    }
}

/// Canvas state rebuilt from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredCanvas {
    pub width: u32,
    pub height: u32,
    /// Row-major palette codes
    pub cells: Vec<u8>,
    /// Pixels replayed on top of the snapshot
    pub applied: usize,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Stored canvas has other dimensions than requested
    DimensionMismatch { stored: (u32, u32), requested: (u32, u32) },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::DimensionMismatch { stored, requested } => write!(
                f,
                "Stored canvas is {}x{}, configured canvas is {}x{}",
                stored.0, stored.1, requested.0, requested.1
            ),
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

/// RocksDB-backed store for one canvas.
pub struct CanvasStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next pixel sequence number
    sequence: AtomicU64,
}

impl CanvasStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
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

        let store = Self {
            db,
            config,
            sequence: AtomicU64::new(0),
        };
        let next = store.recover_sequence()?;
        store.sequence.store(next, Ordering::SeqCst);
        Ok(store)
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

        match name {
            CF_SNAPSHOTS => {
                // Already LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_PIXELS => {
                // Many tiny sequential writes, scanned in order on recovery
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Next sequence: one past the last logged pixel, or the snapshot mark.
    fn recover_sequence(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        let from_log = match iter.next() {
            Some(Ok((key, _))) => decode_sequence(&key).map_or(0, |seq| seq + 1),
            _ => 0,
        };
        let from_meta = self.load_metadata()?.map_or(0, |m| m.snapshot_sequence);
        Ok(from_log.max(from_meta))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self) -> Result<Option<CanvasMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, CANVAS_KEY)? {
            Some(bytes) => CanvasMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Bind the store to a canvas size. A fresh store records it; an existing
    /// one must match.
    pub fn ensure_dimensions(&self, width: u32, height: u32) -> Result<CanvasMetadata, StoreError> {
        if let Some(meta) = self.load_metadata()? {
            if (meta.width, meta.height) != (width, height) {
                return Err(StoreError::DimensionMismatch {
                    stored: (meta.width, meta.height),
                    requested: (width, height),
                });
            }
            return Ok(meta);
        }

        let mut meta = CanvasMetadata::new(width, height);
        meta.snapshot_sequence = self.sequence();
        let cf = self.cf(CF_METADATA)?;
        self.db.put_cf_opt(cf, CANVAS_KEY, meta.encode()?, &self.write_options())?;
        log::info!("Initialized canvas store {}x{} at {}", width, height, self.path().display());
        Ok(meta)
    }

    // ─── Pixel log ────────────────────────────────────────────────────

    /// Append one write. Returns the sequence number assigned.
    pub fn append_pixel(&self, pixel: StoredPixel) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.db
            .put_cf_opt(cf, seq.to_be_bytes(), pixel.encode()?, &self.write_options())?;
        Ok(seq)
    }

    /// Logged pixels with sequence `>= since`, in order.
    pub fn pixels_since(&self, since: u64) -> Result<Vec<(u64, StoredPixel)>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let start_key = since.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));

        let mut pixels = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let Some(seq) = decode_sequence(&key) else {
                continue;
            };
            pixels.push((seq, StoredPixel::decode(&value)?));
        }
        Ok(pixels)
    }

    /// Delete logged pixels with sequence `< up_to`.
    pub fn compact(&self, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PIXELS)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            match decode_sequence(&key) {
                Some(seq) if seq >= up_to => break,
                _ => {}
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
            log::debug!("Compacted {count} pixels below #{up_to}");
        }
        Ok(count)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save the full cell buffer. `covers` is the first sequence NOT included.
    pub fn save_snapshot(&self, cells: &[u8], covers: u64) -> Result<CanvasMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata()?.ok_or_else(|| {
            StoreError::DatabaseError("Canvas dimensions were never recorded".into())
        })?;
        if cells.len() != meta.cell_count() {
            return Err(StoreError::DimensionMismatch {
                stored: (meta.width, meta.height),
                requested: (cells.len() as u32, 1),
            });
        }

        let compressed = lz4_flex::compress_prepend_size(cells);
        meta.snapshot_sequence = covers;
        meta.snapshot_count += 1;
        meta.snapshot_size = cells.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, CANVAS_KEY, &compressed);
        batch.put_cf(cf_meta, CANVAS_KEY, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(meta)
    }

    fn load_snapshot(&self, meta: &CanvasMetadata) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, CANVAS_KEY)? else {
            return Ok(None);
        };
        let cells = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        if cells.len() != meta.cell_count() {
            return Err(StoreError::DeserializationError(format!(
                "Snapshot has {} cells, expected {}",
                cells.len(),
                meta.cell_count()
            )));
        }
        Ok(Some(cells))
    }

    /// Rebuild the canvas: snapshot plus every pixel logged after it.
    /// Returns `None` for a store that has never been bound to a canvas.
    pub fn load(&self) -> Result<Option<RecoveredCanvas>, StoreError> {
        let Some(meta) = self.load_metadata()? else {
            return Ok(None);
        };

        let mut cells = self
            .load_snapshot(&meta)?
            .unwrap_or_else(|| vec![0; meta.cell_count()]);

        let mut applied = 0;
        for (seq, pixel) in self.pixels_since(meta.snapshot_sequence)? {
            if pixel.x >= meta.width || pixel.y >= meta.height {
                log::warn!("Skipping logged pixel #{seq} outside the canvas");
                continue;
            }
            let index = pixel.y as usize * meta.width as usize + pixel.x as usize;
            cells[index] = pixel.color;
            applied += 1;
        }

        Ok(Some(RecoveredCanvas {
            width: meta.width,
            height: meta.height,
            cells,
            applied,
        }))
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Next pixel sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
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

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

fn decode_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
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
