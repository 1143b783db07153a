//! The shared canvas: one exclusion boundary around grid and cooldowns.
//!
//! ```text
//!  set_pixel ──► lock ──► CooldownLimiter ──► Grid::apply_write ──► BroadcastHub::publish ──► unlock
//!                                                          │
//!                                                          └──► Replication::publish_local (try_send)
//! ```
//!
//! Commit and fan-out enqueue happen under the same lock, so the order in
//! which writes commit is the order every session sees them. `attach` takes
//! the snapshot and registers the new session under that lock too: the
//! session gets exactly the commits after its snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastHub, BroadcastStats};
use crate::cooldown::{Admission, CooldownLimiter, CooldownStats};
use crate::grid::{Committed, Grid, GridError, GridSnapshot, Palette};
use crate::protocol::{ServerMessage, WireColor};
use crate::replication::{ReplicaId, Replicated, Replication};
use crate::session::{ClientSession, SessionId, SessionRegistry, UserIdentity};

/// Admissions between sweeps of expired cooldown records.
const PRUNE_INTERVAL: u64 = 4096;

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written and broadcast
    Committed(Committed),
    /// Refused by the rate limiter; the caller tells the requester
    Cooldown(Duration),
    /// Admitted but refused by the grid; dropped without reply
    Rejected(GridError),
}

/// A newly registered session and the state it starts from.
pub struct Attached {
    pub session: Arc<ClientSession>,
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub snapshot: GridSnapshot,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanvasStats {
    /// Writes committed, local and replicated
    pub commits: u64,
    pub cooldown: CooldownStats,
    pub broadcast: BroadcastStats,
}

struct CanvasState {
    grid: Grid,
    cooldowns: CooldownLimiter,
    /// Commits so far; the last commit's sequence number
    sequence: u64,
    admissions_since_prune: u64,
}

/// The authoritative canvas.
pub struct Canvas {
    state: Mutex<CanvasState>,
    registry: Arc<SessionRegistry>,
    hub: BroadcastHub,
    replication: Replication,
    replica_id: ReplicaId,
    palette: Palette,
    outbound_capacity: usize,
}

impl Canvas {
    pub fn new(grid: Grid, cooldown: Duration, outbound_capacity: usize, echo_to_origin: bool) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let palette = grid.palette().clone();
        Self {
            state: Mutex::new(CanvasState {
                grid,
                cooldowns: CooldownLimiter::new(cooldown),
                sequence: 0,
                admissions_since_prune: 0,
            }),
            hub: BroadcastHub::new(registry.clone(), echo_to_origin),
            registry,
            replication: Replication::new(),
            replica_id: ReplicaId::new(),
            palette,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    pub fn with_replication(mut self, replication: Replication) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = replica_id;
        self
    }

    /// Register a new session and capture the grid it starts from.
    pub async fn attach(&self, identity: UserIdentity, addr: Option<SocketAddr>) -> Attached {
        let (session, outbound) = ClientSession::new(identity, addr, self.outbound_capacity);
        let state = self.state.lock().await;
        let snapshot = state.grid.snapshot();
        session.open();
        self.registry.register(session.clone()).await;
        drop(state);

        log::info!(
            "Session {} attached as {} ({} live)",
            session.id(),
            session.identity(),
            self.registry.len().await
        );
        Attached {
            session,
            outbound,
            snapshot,
        }
    }

    /// Remove a session from the fan-out set. Safe to call more than once.
    pub async fn detach(&self, id: &SessionId) {
        if let Some(session) = self.registry.unregister(id).await {
            log::info!("Session {} ({}) detached", session.id(), session.identity());
        }
    }

    /// Gate, commit, and broadcast one write from `session`.
    pub async fn submit(
        &self,
        session: &ClientSession,
        x: i64,
        y: i64,
        color: &WireColor,
        now: Instant,
    ) -> WriteOutcome {
        let mut state = self.state.lock().await;

        if let Admission::Rejected { remaining } = state.cooldowns.try_admit(session.identity(), now) {
            return WriteOutcome::Cooldown(remaining);
        }
        state.admissions_since_prune += 1;
        if state.admissions_since_prune >= PRUNE_INTERVAL {
            state.admissions_since_prune = 0;
            let pruned = state.cooldowns.prune(now);
            log::trace!("Pruned {pruned} expired cooldown records");
        }

        let committed = match color
            .resolve(state.grid.palette())
            .and_then(|value| state.grid.apply_write(x, y, value))
        {
            Ok(committed) => committed,
            Err(e) => {
                log::debug!("Dropped write from {} at ({x}, {y}): {e}", session.identity());
                return WriteOutcome::Rejected(e);
            }
        };

        state.sequence += 1;
        let sequence = state.sequence;
        self.fan_out(&committed, Some(session.id())).await;
        self.replication
            .publish_local(&Replicated::new(self.replica_id, sequence, &committed));
        drop(state);

        WriteOutcome::Committed(committed)
    }

    /// Apply a write committed by another replica. No cooldown applies and the
    /// write is not forwarded to other replicas, only to local sinks.
    pub async fn apply_remote(&self, event: &Replicated) -> Result<Option<Committed>, GridError> {
        if event.origin == self.replica_id {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let committed =
            state
                .grid
                .apply_write(event.x as i64, event.y as i64, event.color_value())?;
        state.sequence += 1;
        self.fan_out(&committed, None).await;
        self.replication.publish_remote(event);
        drop(state);

        log::trace!("Applied write #{} from replica {}", event.sequence, event.origin);
        Ok(Some(committed))
    }

    async fn fan_out(&self, committed: &Committed, origin: Option<SessionId>) {
        match self.hub.publish(&ServerMessage::pixel(committed), origin).await {
            Ok(report) if report.evicted > 0 => {
                log::debug!("Commit at ({}, {}) evicted {} sessions", committed.x, committed.y, report.evicted);
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to broadcast commit: {e}"),
        }
    }

    /// Drain every bridge subscription into `apply_remote`.
    pub fn spawn_replica_pumps(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for bridge in self.replication.bridges() {
            let Some(mut rx) = bridge.subscribe() else {
                continue;
            };
            let canvas = self.clone();
            let name = bridge.name();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = canvas.apply_remote(&event).await {
                        log::warn!("Ignoring replicated write #{} from {}: {e}", event.sequence, event.origin);
                    }
                }
                log::debug!("Replica subscription on {name} closed");
            }));
        }
        handles
    }

    /// Restore persisted cells. Returns how many unknown color codes were cleared.
    pub async fn restore(&self, cells: &[u8]) -> Result<usize, GridError> {
        self.state.lock().await.grid.restore(cells)
    }

    pub async fn snapshot(&self) -> GridSnapshot {
        self.state.lock().await.grid.snapshot()
    }

    /// `init` message for the current grid.
    pub async fn init_message(&self) -> ServerMessage {
        ServerMessage::init(&self.snapshot().await, &self.palette)
    }

    pub async fn stats(&self) -> CanvasStats {
        let state = self.state.lock().await;
        CanvasStats {
            commits: state.sequence,
            cooldown: state.cooldowns.stats(),
            broadcast: self.hub.stats(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn replication(&self) -> &Replication {
        &self.replication
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ColorValue;
    use crate::replication::{ReplicationBridge, ReplicationBus};

    const WINDOW: Duration = Duration::from_millis(5000);

    fn canvas(echo: bool) -> Canvas {
        let grid = Grid::new(4, 4, Palette::default()).unwrap();
        Canvas::new(grid, WINDOW, 16, echo)
    }

    async fn next_text(rx: &mut mpsc::Receiver<Arc<str>>) -> ServerMessage {
        ServerMessage::decode(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_commits_and_broadcasts() {
        let canvas = canvas(true);
        let mut alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let mut bob = canvas.attach(UserIdentity::new("bob"), None).await;

        let outcome = canvas
            .submit(&alice.session, 1, 2, &WireColor::Code(5), Instant::now())
            .await;
        assert!(matches!(outcome, WriteOutcome::Committed(_)));

        let expected = ServerMessage::Pixel { x: 1, y: 2, color: 5 };
        assert_eq!(next_text(&mut alice.outbound).await, expected);
        assert_eq!(next_text(&mut bob.outbound).await, expected);
        assert_eq!(canvas.snapshot().await.get(1, 2), Some(ColorValue::Color(5)));
    }

    #[tokio::test]
    async fn test_cooldown_rejects_second_attempt() {
        let canvas = canvas(true);
        let mut alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let t = Instant::now();

        canvas.submit(&alice.session, 1, 2, &WireColor::Code(5), t).await;
        let outcome = canvas
            .submit(&alice.session, 2, 2, &WireColor::Code(3), t + Duration::from_millis(10))
            .await;
        assert_eq!(outcome, WriteOutcome::Cooldown(Duration::from_millis(4990)));

        assert_eq!(canvas.snapshot().await.get(2, 2), Some(ColorValue::Unset));
        // Only the first commit was broadcast
        next_text(&mut alice.outbound).await;
        assert!(alice.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cooldown_shared_across_sessions_of_one_identity() {
        let canvas = canvas(true);
        let first = canvas.attach(UserIdentity::new("alice"), None).await;
        let second = canvas.attach(UserIdentity::new("alice"), None).await;
        let t = Instant::now();

        canvas.submit(&first.session, 0, 0, &WireColor::Code(1), t).await;
        let outcome = canvas.submit(&second.session, 1, 1, &WireColor::Code(1), t).await;
        assert!(matches!(outcome, WriteOutcome::Cooldown(_)));
    }

    #[tokio::test]
    async fn test_out_of_bounds_consumes_cooldown_silently() {
        let canvas = canvas(true);
        let mut alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let t = Instant::now();

        let outcome = canvas.submit(&alice.session, 4, 0, &WireColor::Code(1), t).await;
        assert_eq!(outcome, WriteOutcome::Rejected(GridError::OutOfBounds { x: 4, y: 0 }));
        assert!(alice.outbound.try_recv().is_err());

        let outcome = canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), t).await;
        assert!(matches!(outcome, WriteOutcome::Cooldown(_)));
        assert_eq!(canvas.snapshot().await.painted(), 0);
    }

    #[tokio::test]
    async fn test_invalid_color_rejected() {
        let canvas = canvas(true);
        let alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let outcome = canvas
            .submit(&alice.session, 0, 0, &WireColor::Code(0), Instant::now())
            .await;
        assert_eq!(outcome, WriteOutcome::Rejected(GridError::InvalidColor));

        let bob = canvas.attach(UserIdentity::new("bob"), None).await;
        let outcome = canvas
            .submit(&bob.session, 0, 0, &WireColor::Hex("#123456".into()), Instant::now())
            .await;
        assert_eq!(outcome, WriteOutcome::Rejected(GridError::InvalidColor));
    }

    #[tokio::test]
    async fn test_no_echo_to_origin() {
        let canvas = canvas(false);
        let mut alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let mut bob = canvas.attach(UserIdentity::new("bob"), None).await;

        canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), Instant::now()).await;
        assert!(bob.outbound.recv().await.is_some());
        assert!(alice.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attach_snapshot_then_only_later_commits() {
        let canvas = canvas(true);
        let alice = canvas.attach(UserIdentity::new("alice"), None).await;
        canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), Instant::now()).await;

        let mut late = canvas.attach(UserIdentity::new("late"), None).await;
        assert_eq!(late.snapshot.get(0, 0), Some(ColorValue::Color(1)));
        // The earlier commit is in the snapshot, not replayed
        assert!(late.outbound.try_recv().is_err());

        let bob = canvas.attach(UserIdentity::new("bob"), None).await;
        canvas.submit(&bob.session, 1, 0, &WireColor::Code(2), Instant::now()).await;
        assert_eq!(
            next_text(&mut late.outbound).await,
            ServerMessage::Pixel { x: 1, y: 0, color: 2 }
        );
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let canvas = canvas(true);
        let alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let mut bob = canvas.attach(UserIdentity::new("bob"), None).await;
        canvas.detach(&bob.session.id()).await;
        canvas.detach(&bob.session.id()).await;

        canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), Instant::now()).await;
        assert!(bob.outbound.try_recv().is_err());
        assert_eq!(canvas.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_two_canvases_converge_over_bus() {
        let bus = ReplicationBus::new();
        let mut left_rep = Replication::new();
        left_rep.add(Arc::new(bus.join(64)));
        let mut right_rep = Replication::new();
        right_rep.add(Arc::new(bus.join(64)));

        let left = Arc::new(canvas(true).with_replication(left_rep));
        let right = Arc::new(canvas(true).with_replication(right_rep));
        left.spawn_replica_pumps();
        right.spawn_replica_pumps();

        let mut viewer = right.attach(UserIdentity::new("viewer"), None).await;
        let alice = left.attach(UserIdentity::new("alice"), None).await;
        left.submit(&alice.session, 3, 3, &WireColor::Code(7), Instant::now()).await;

        assert_eq!(
            next_text(&mut viewer.outbound).await,
            ServerMessage::Pixel { x: 3, y: 3, color: 7 }
        );
        assert_eq!(right.snapshot().await, left.snapshot().await);
        assert_eq!(right.stats().await.commits, 1);
    }

    #[tokio::test]
    async fn test_apply_remote_ignores_own_origin() {
        let canvas = canvas(true);
        let event = Replicated {
            origin: canvas.replica_id(),
            sequence: 1,
            x: 0,
            y: 0,
            color: 1,
        };
        assert_eq!(canvas.apply_remote(&event).await, Ok(None));
        assert_eq!(canvas.snapshot().await.painted(), 0);
    }

    #[tokio::test]
    async fn test_apply_remote_not_forwarded_to_forwarding_bridges() {
        let bus = ReplicationBus::new();
        let bridge = Arc::new(bus.join(8));
        let observer = bus.join(8);
        let mut observer_rx = observer.subscribe().unwrap();

        let mut replication = Replication::new();
        replication.add(bridge);
        let canvas = canvas(true).with_replication(replication);

        let event = Replicated {
            origin: ReplicaId::new(),
            sequence: 9,
            x: 1,
            y: 1,
            color: 2,
        };
        assert!(canvas.apply_remote(&event).await.unwrap().is_some());
        // The channel bridge forwards, so it must not see the remote write
        assert!(observer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_apply_remote_out_of_bounds() {
        let canvas = canvas(true);
        let event = Replicated {
            origin: ReplicaId::new(),
            sequence: 1,
            x: 10,
            y: 0,
            color: 1,
        };
        assert_eq!(
            canvas.apply_remote(&event).await,
            Err(GridError::OutOfBounds { x: 10, y: 0 })
        );
    }

    #[tokio::test]
    async fn test_restore_and_init_message() {
        let canvas = canvas(true);
        let mut cells = vec![0u8; 16];
        cells[5] = 3;
        cells[6] = 200;
        assert_eq!(canvas.restore(&cells).await, Ok(1));

        let init = canvas.init_message().await;
        let snapshot = init.snapshot().unwrap();
        assert_eq!(snapshot.get(1, 1), Some(ColorValue::Color(3)));
        assert_eq!(snapshot.get(2, 1), Some(ColorValue::Unset));
    }

    #[tokio::test]
    async fn test_stats() {
        let canvas = canvas(true);
        let alice = canvas.attach(UserIdentity::new("alice"), None).await;
        let t = Instant::now();
        canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), t).await;
        canvas.submit(&alice.session, 0, 0, &WireColor::Code(1), t).await;

        let stats = canvas.stats().await;
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.cooldown.admitted, 1);
        assert_eq!(stats.cooldown.rejected, 1);
        assert_eq!(stats.broadcast.published, 1);
    }
}
