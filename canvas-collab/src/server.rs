//! WebSocket canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                    ┌── StoreBridge ── CanvasStore (RocksDB)
//!             ├── ConnectionHandler ── Canvas ────┤
//! Client B ──┘          │               │         └── PeerBridge  ── ws://replica?replica=<key>
//!                       │               └── BroadcastHub
//! Replica  ─────────────┘ (mirror)             │
//!                                  ┌───────────┼───────────┐
//!                                  ▼           ▼           ▼
//!                               Client A    Client B    Client C
//! ```
//!
//! Startup: open the store (if configured), recover the grid from the last
//! snapshot plus the pixel log, start the persistence worker and replica
//! links, then accept connections.
//!
//! Shutdown: signal every connection task to close, wait for them, then let
//! the persistence worker drain its queue and write a final snapshot.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::canvas::Canvas;
use crate::config::{ConfigError, ServerConfig};
use crate::connection::ConnectionHandler;
use crate::grid::{Grid, GridError};
use crate::replication::store::StoreWorkerStats;
use crate::replication::{PeerBridge, Replication, ReplicationBridge, StoreBridge};
use crate::storage::{CanvasStore, StoreConfig};

/// Queue bound for the persistence worker.
const STORE_QUEUE_CAPACITY: usize = 65_536;

/// Queue bound per replica link, also the size of its offline queue.
const PEER_QUEUE_CAPACITY: usize = 65_536;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub replica_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    /// Pixels replayed from storage at startup
    pub recovered_pixels: u64,
}

/// Errors that stop the server from starting.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Grid(GridError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "Configuration error: {e}"),
            ServerError::Grid(e) => write!(f, "Grid error: {e}"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Grid(e) => Some(e),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<GridError> for ServerError {
    fn from(e: GridError) -> Self {
        ServerError::Grid(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    canvas: Arc<Canvas>,
    handler: ConnectionHandler,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent canvas store (optional)
    store: Option<Arc<CanvasStore>>,
    store_worker: Option<JoinHandle<StoreWorkerStats>>,
    /// Replica links and subscription pumps
    tasks: Vec<JoinHandle<()>>,
    /// Live connection tasks
    connections: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl CanvasServer {
    /// Build the server. Spawns background tasks, so it must run inside a
    /// tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_bridges(config, Vec::new())
    }

    /// Build the server with additional replication bridges.
    pub fn with_bridges(
        config: ServerConfig,
        bridges: Vec<Arc<dyn ReplicationBridge>>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let mut grid = Grid::new(config.width, config.height, config.palette.clone())?;
        let mut stats = ServerStats::default();
        let mut replication = Replication::new();
        let mut tasks = Vec::new();

        let store = Self::open_store(&config, &mut grid, &mut stats);
        let store_worker = store.as_ref().map(|store| {
            let (bridge, handle) = StoreBridge::spawn(
                store.clone(),
                config.width,
                grid.snapshot().cells,
                config.snapshot_every,
                STORE_QUEUE_CAPACITY,
            );
            replication.add(Arc::new(bridge));
            handle
        });

        if let Some(key) = config.replica_key.as_deref() {
            for url in &config.replica_peers {
                let (bridge, handle) = PeerBridge::spawn(url.as_str(), key, PEER_QUEUE_CAPACITY);
                replication.add(Arc::new(bridge));
                tasks.push(handle);
            }
        }

        for bridge in bridges {
            replication.add(bridge);
        }

        let canvas = Arc::new(
            Canvas::new(
                grid,
                config.cooldown,
                config.outbound_capacity,
                config.echo_to_origin,
            )
            .with_replication(replication),
        );
        tasks.extend(canvas.spawn_replica_pumps());

        let stats = Arc::new(RwLock::new(stats));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = ConnectionHandler::new(
            canvas.clone(),
            config.replica_key.clone(),
            stats.clone(),
            shutdown_rx,
        );

        log::info!(
            "Canvas {}x{} ready (cooldown {}ms, replica {})",
            config.width,
            config.height,
            config.cooldown.as_millis(),
            canvas.replica_id()
        );

        Ok(Self {
            config,
            canvas,
            handler,
            stats,
            store,
            store_worker,
            tasks,
            connections: Mutex::new(JoinSet::new()),
            shutdown,
        })
    }

    /// Open the store and restore the grid from it. Any failure is logged and
    /// the server runs without persistence on a blank grid.
    fn open_store(
        config: &ServerConfig,
        grid: &mut Grid,
        stats: &mut ServerStats,
    ) -> Option<Arc<CanvasStore>> {
        let path = config.storage_path.as_ref()?;
        let result = CanvasStore::open(StoreConfig::new(path)).and_then(|store| {
            store.ensure_dimensions(config.width, config.height)?;
            let recovered = store.load()?;
            Ok((store, recovered))
        });

        let (store, recovered) = match result {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("Persistence disabled, starting blank: {e}");
                return None;
            }
        };

        if let Some(recovered) = recovered {
            match grid.restore(&recovered.cells) {
                Ok(cleared) => {
                    if cleared > 0 {
                        log::warn!("Cleared {cleared} stored cells with colors outside the palette");
                    }
                    stats.recovered_pixels = recovered.applied as u64;
                    log::info!(
                        "Recovered canvas from {} ({} logged pixels replayed)",
                        store.path().display(),
                        recovered.applied
                    );
                }
                Err(e) => {
                    log::error!("Stored canvas unusable, persistence disabled: {e}");
                    return None;
                }
            }
        }

        Some(Arc::new(store))
    }

    /// Bind the configured address and serve until an unrecoverable error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("Canvas server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown. Accept errors are
    /// logged and the loop continues.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.handler.stopping() => {
                    log::info!("Stopped accepting connections");
                    return Ok(());
                }
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");
            let _ = stream.set_nodelay(true);

            let handler = self.handler.clone();
            let mut connections = self.connections.lock().await;
            // Reap finished connections
            while connections.try_join_next().is_some() {}
            connections.spawn(async move {
                if let Err(e) = handler.handle(stream, Some(addr)).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stop accepting, close every connection, and wait for their tasks.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut connections = self.connections.lock().await;
        let open = connections.len();
        while let Some(result) = connections.join_next().await {
            if let Err(e) = result {
                log::error!("Connection task failed: {e}");
            }
        }
        log::info!("Closed {open} connections");
    }

    /// Shut down, stop background work, and wait for the persistence worker
    /// to flush.
    pub async fn close(self) -> Option<StoreWorkerStats> {
        self.shutdown().await;
        let Self {
            canvas,
            handler,
            store_worker,
            tasks,
            ..
        } = self;
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        drop(handler);
        drop(canvas);

        match store_worker?.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::error!("Store worker failed: {e}");
                None
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn canvas(&self) -> &Arc<Canvas> {
        &self.canvas
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<CanvasStore>> {
        self.store.as_ref()
    }
}
