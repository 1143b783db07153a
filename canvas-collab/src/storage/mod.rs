//! Persistent storage for the canvas.
//!
//! ```text
//! ┌─────────────┐  Replicated   ┌─────────────┐   writes   ┌──────────────────────────────┐
//! │   Canvas    │ ────────────► │ StoreBridge │ ─────────► │ CanvasStore (RocksDB)        │
//! │ (in-memory) │  (try_send)   │  (worker)   │            │  CF "snapshots" LZ4 cells    │
//! └──────▲──────┘               └─────────────┘            │  CF "pixels"    write log    │
//!        │ on startup                                      │  CF "metadata"  dimensions   │
//!        └──────────────────── load() ─────────────────────┴──────────────────────────────┘
//! ```
//!
//! Writes reach disk asynchronously. A crash can lose the writes still queued
//! for the worker; everything the worker has appended survives.

pub mod rocks;

pub use rocks::{CanvasMetadata, CanvasStore, RecoveredCanvas, StoreConfig, StoreError, StoredPixel};
