//! Optional side-channel for committed writes.
//!
//! ```text
//!                       ┌──────────────┐
//!  Canvas commit ──────►│ Replication  │── publish ──► StoreBridge  (RocksDB)
//!  (under canvas lock)  │ (fan-out to  │── publish ──► PeerBridge   (ws push)
//!                       │  bridges)    │── publish ──► ChannelBridge (in-proc)
//!                       └──────────────┘
//!  Canvas::apply_remote ◄── subscribe() ─── ChannelBridge / replica connections
//! ```
//!
//! Every `publish` is non-blocking. A bridge that cannot keep up reports
//! `ReplicationError` and the event is dropped for that bridge only; the local
//! commit and broadcast never wait on a bridge.

pub mod channel;
pub mod peer;
pub mod store;

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::grid::{ColorValue, Committed};

pub use channel::{ChannelBridge, ReplicationBus};
pub use peer::{OfflineQueue, PeerBridge};
pub use store::StoreBridge;

/// Identifies one authoritative canvas process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed write tagged with the replica that committed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicated {
    pub origin: ReplicaId,
    /// Commit sequence number on `origin`
    pub sequence: u64,
    pub x: u32,
    pub y: u32,
    /// Palette code, never 0
    pub color: u8,
}

impl Replicated {
    pub fn new(origin: ReplicaId, sequence: u64, committed: &Committed) -> Self {
        Self {
            origin,
            sequence,
            x: committed.x,
            y: committed.y,
            color: committed.color.code(),
        }
    }

    pub fn color_value(&self) -> ColorValue {
        ColorValue::from_code(self.color)
    }
}

/// Why a bridge dropped an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The bridge's queue is full
    QueueFull { bridge: &'static str },
    /// The bridge's worker is gone
    SinkUnavailable { bridge: &'static str },
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::QueueFull { bridge } => write!(f, "Replication queue full ({bridge})"),
            ReplicationError::SinkUnavailable { bridge } => {
                write!(f, "Replication sink unavailable ({bridge})")
            }
        }
    }
}

impl std::error::Error for ReplicationError {}

/// Pluggable persistence / pub-sub side-channel.
pub trait ReplicationBridge: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Hand off a committed write. Must not block.
    fn publish(&self, event: &Replicated) -> Result<(), ReplicationError>;

    /// Stream of writes committed elsewhere. Yields `Some` at most once.
    fn subscribe(&self) -> Option<mpsc::Receiver<Replicated>> {
        None
    }

    /// Whether writes received from other replicas should also go here.
    /// Sinks that forward to other replicas return `false` to avoid loops.
    fn accepts_remote(&self) -> bool {
        false
    }
}

/// Bridge that drops everything. A legal stand-in for "no replication".
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBridge;

impl ReplicationBridge for NoopBridge {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn publish(&self, _event: &Replicated) -> Result<(), ReplicationError> {
        Ok(())
    }
}

/// The set of bridges a canvas publishes to.
#[derive(Clone, Default)]
pub struct Replication {
    bridges: Vec<Arc<dyn ReplicationBridge>>,
}

impl Replication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bridge: Arc<dyn ReplicationBridge>) {
        log::info!("Replication bridge attached: {}", bridge.name());
        self.bridges.push(bridge);
    }

    pub fn bridges(&self) -> &[Arc<dyn ReplicationBridge>] {
        &self.bridges
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Publish a local commit to every bridge. Returns how many accepted it.
    pub fn publish_local(&self, event: &Replicated) -> usize {
        self.publish_filtered(event, |_| true)
    }

    /// Publish a write applied from another replica to the bridges that want it.
    pub fn publish_remote(&self, event: &Replicated) -> usize {
        self.publish_filtered(event, |b| b.accepts_remote())
    }

    fn publish_filtered(
        &self,
        event: &Replicated,
        wanted: impl Fn(&dyn ReplicationBridge) -> bool,
    ) -> usize {
        let mut accepted = 0;
        for bridge in &self.bridges {
            if !wanted(&**bridge) {
                continue;
            }
            match bridge.publish(event) {
                Ok(()) => accepted += 1,
                Err(e) => log::warn!("Dropping replicated write #{}: {e}", event.sequence),
            }
        }
        accepted
    }
}
