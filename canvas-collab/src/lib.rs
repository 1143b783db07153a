//! # canvas-collab — Shared-canvas collaborative drawing server
//!
//! Many clients paint cells of one fixed-size grid over WebSocket. The server
//! owns the authoritative grid, rate-limits writes per user identity, and
//! fans every committed write out to all connected clients in commit order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌─────────────────────────────┐
//! │ CanvasClient │ ◄────────────────► │ ConnectionHandler (per conn)│
//! │ (per user)   │     JSON frames    └──────────────┬──────────────┘
//! └──────────────┘                                   │
//!                                                    ▼
//!                                  ┌─────────────────────────────────┐
//!                                  │ Canvas (one lock)               │
//!                                  │  CooldownLimiter → Grid         │
//!                                  └───────┬─────────────────┬───────┘
//!                                          │                 │
//!                                          ▼                 ▼
//!                                  ┌───────────────┐ ┌───────────────┐
//!                                  │ BroadcastHub  │ │ Replication   │
//!                                  │ (fan-out)     │ │ (store, peers)│
//!                                  └───────────────┘ └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`grid`] — Cell storage, palette, bounds and color validation
//! - [`cooldown`] — Per-identity write rate limiting
//! - [`session`] — Client sessions, bounded outbound queues, registry
//! - [`broadcast`] — Fan-out of committed writes with overflow eviction
//! - [`canvas`] — The exclusion boundary tying the above together
//! - [`protocol`] — JSON wire messages
//! - [`connection`] — Per-connection WebSocket task
//! - [`server`] — Accept loop, startup recovery, shutdown
//! - [`replication`] — Optional mirroring of commits (storage, peers)
//! - [`storage`] — RocksDB snapshots and pixel log
//! - [`client`] — WebSocket client
//! - [`config`] — Environment configuration

pub mod broadcast;
pub mod canvas;
pub mod client;
pub mod config;
pub mod connection;
pub mod cooldown;
pub mod grid;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, BroadcastStats, DeliveryReport};
pub use canvas::{Attached, Canvas, CanvasStats, WriteOutcome};
pub use client::{CanvasClient, CanvasEvent, ConnectionState};
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionHandler, Role};
pub use cooldown::{Admission, CooldownLimiter, CooldownStats};
pub use grid::{ColorValue, Committed, Grid, GridError, GridSnapshot, Palette, PaletteError};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, WireColor};
pub use replication::{
    ChannelBridge, NoopBridge, OfflineQueue, PeerBridge, ReplicaId, Replicated, Replication,
    ReplicationBridge, ReplicationBus, ReplicationError, StoreBridge,
};
pub use server::{CanvasServer, ServerError, ServerStats};
pub use session::{ClientSession, Delivery, SessionId, SessionRegistry, SessionState, UserIdentity};
pub use storage::{
    CanvasMetadata, CanvasStore, RecoveredCanvas, StoreConfig, StoreError, StoredPixel,
};
