//! Persistence bridge: commits flow to a RocksDB worker.
//!
//! The worker keeps a shadow copy of the cell buffer so it can write a full
//! snapshot every `snapshot_every` pixels without touching the canvas lock.
//! After each snapshot the covered part of the pixel log is compacted. A final
//! snapshot is written when the bridge is dropped and the queue drains.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Replicated, ReplicationBridge, ReplicationError};
use crate::storage::{CanvasStore, StoredPixel};

/// Counters reported by the worker when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreWorkerStats {
    pub appended: u64,
    pub snapshots: u64,
    pub failures: u64,
}

/// Bridge that persists every commit, local or replicated.
pub struct StoreBridge {
    tx: mpsc::Sender<Replicated>,
}

impl StoreBridge {
    /// Start the worker. `cells` must be the canvas contents at the
    /// moment the bridge is attached.
    pub fn spawn(
        store: Arc<CanvasStore>,
        width: u32,
        cells: Vec<u8>,
        snapshot_every: u64,
        capacity: usize,
    ) -> (Self, JoinHandle<StoreWorkerStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = StoreWorker {
            store,
            width,
            cells,
            snapshot_every: snapshot_every.max(1),
            since_snapshot: 0,
            stats: StoreWorkerStats::default(),
        };
        let handle = tokio::task::spawn_blocking(move || worker.run(rx));
        (Self { tx }, handle)
    }
}

impl ReplicationBridge for StoreBridge {
    fn name(&self) -> &'static str {
        "store"
    }

    fn publish(&self, event: &Replicated) -> Result<(), ReplicationError> {
        self.tx.try_send(*event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReplicationError::QueueFull { bridge: "store" },
            mpsc::error::TrySendError::Closed(_) => {
                ReplicationError::SinkUnavailable { bridge: "store" }
            }
        })
    }

    fn accepts_remote(&self) -> bool {
        true
    }
}

struct StoreWorker {
    store: Arc<CanvasStore>,
    width: u32,
    cells: Vec<u8>,
    snapshot_every: u64,
    since_snapshot: u64,
    stats: StoreWorkerStats,
}

impl StoreWorker {
    fn run(mut self, mut rx: mpsc::Receiver<Replicated>) -> StoreWorkerStats {
        while let Some(event) = rx.blocking_recv() {
            self.apply(&event);
            if self.since_snapshot >= self.snapshot_every {
                self.snapshot();
            }
        }
        if self.since_snapshot > 0 {
            self.snapshot();
        }
        if let Err(e) = self.store.sync() {
            log::error!("Failed to flush canvas store: {e}");
        }
        log::info!(
            "Store worker stopped: {} pixels, {} snapshots, {} failures",
            self.stats.appended,
            self.stats.snapshots,
            self.stats.failures
        );
        self.stats
    }

    fn apply(&mut self, event: &Replicated) {
        let pixel = StoredPixel {
            x: event.x,
            y: event.y,
            color: event.color,
        };
        match self.store.append_pixel(pixel) {
            Ok(_) => {
                let index = event.y as usize * self.width as usize + event.x as usize;
                if let Some(cell) = self.cells.get_mut(index) {
                    *cell = event.color;
                }
                self.stats.appended += 1;
                self.since_snapshot += 1;
            }
            Err(e) => {
                self.stats.failures += 1;
                log::error!("Failed to persist pixel ({}, {}): {e}", event.x, event.y);
            }
        }
    }

    fn snapshot(&mut self) {
        let covers = self.store.sequence();
        match self.store.save_snapshot(&self.cells, covers) {
            Ok(meta) => {
                self.stats.snapshots += 1;
                self.since_snapshot = 0;
                log::debug!(
                    "Canvas snapshot #{}: {} → {} bytes",
                    meta.snapshot_count,
                    meta.snapshot_size,
                    meta.compressed_size
                );
                if let Err(e) = self.store.compact(covers) {
                    log::warn!("Pixel log compaction failed: {e}");
                }
            }
            Err(e) => {
                self.stats.failures += 1;
                log::error!("Failed to save canvas snapshot: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicaId;
    use crate::storage::StoreConfig;

    fn event(sequence: u64, x: u32, y: u32, color: u8) -> Replicated {
        Replicated {
            origin: ReplicaId::new(),
            sequence,
            x,
            y,
            color,
        }
    }

    fn open(dir: &tempfile::TempDir) -> Arc<CanvasStore> {
        let store = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.ensure_dimensions(4, 4).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_worker_persists_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let (bridge, handle) = StoreBridge::spawn(store.clone(), 4, vec![0; 16], 2, 16);
        assert!(bridge.accepts_remote());
        bridge.publish(&event(1, 1, 2, 5)).unwrap();
        bridge.publish(&event(2, 0, 0, 3)).unwrap();
        bridge.publish(&event(3, 3, 3, 1)).unwrap();
        drop(bridge);

        let stats = handle.await.unwrap();
        assert_eq!(stats.appended, 3);
        // One periodic snapshot plus the final one
        assert_eq!(stats.snapshots, 2);
        assert_eq!(stats.failures, 0);

        // Everything is covered by the snapshot and the log is compacted
        assert!(store.pixels_since(0).unwrap().is_empty());
        let canvas = store.load().unwrap().unwrap();
        assert_eq!(canvas.cells[2 * 4 + 1], 5);
        assert_eq!(canvas.cells[0], 3);
        assert_eq!(canvas.cells[15], 1);
    }

    #[tokio::test]
    async fn test_initial_cells_kept_in_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let mut cells = vec![0; 16];
        cells[7] = 9;
        let (bridge, handle) = StoreBridge::spawn(store.clone(), 4, cells, 100, 16);
        bridge.publish(&event(1, 0, 0, 2)).unwrap();
        drop(bridge);
        assert_eq!(handle.await.unwrap().snapshots, 1);

        let canvas = store.load().unwrap().unwrap();
        assert_eq!(canvas.cells[7], 9);
        assert_eq!(canvas.cells[0], 2);
    }

    #[tokio::test]
    async fn test_idle_worker_writes_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let (bridge, handle) = StoreBridge::spawn(store.clone(), 4, vec![0; 16], 10, 4);
        drop(bridge);
        assert_eq!(handle.await.unwrap(), StoreWorkerStats::default());
        assert_eq!(store.load_metadata().unwrap().unwrap().snapshot_count, 0);
    }
}
