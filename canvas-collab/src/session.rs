//! Live client sessions and the registry that fanout iterates.
//!
//! ```text
//!  ConnectionSession ──owns rx──► mpsc::Receiver<Arc<str>> ──► socket
//!          │
//!          ▼ register / unregister
//!  SessionRegistry { SessionId → Arc<ClientSession> } ◄── BroadcastHub::publish
//!                                        │
//!                                        └── try_send(Arc<str>) into bounded queue
//! ```
//!
//! Cooldowns are keyed by `UserIdentity`, never by `SessionId`, so a reconnect
//! under the same name keeps its cooldown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use percent_encoding::percent_decode_str;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

/// Longest identity kept from the `user` query parameter.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Prefix of generated identities.
pub const ANONYMOUS_PREFIX: &str = "anon-";

/// Unique handle for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque rate-limit key supplied by the client. Not authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Trims whitespace and caps the length; empty names become anonymous.
    pub fn new(name: impl AsRef<str>) -> Self {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            return Self::anonymous();
        }
        Self(trimmed.chars().take(MAX_IDENTITY_LEN).collect())
    }

    /// A fresh identity unique to one connection.
    pub fn anonymous() -> Self {
        Self(format!("{ANONYMOUS_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Derive the identity from a connection query string such as `user=alice`.
    pub fn from_query(query: Option<&str>) -> Self {
        match query.and_then(|q| query_param(q, "user")) {
            Some(name) => Self::new(name),
            None => Self::anonymous(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_PREFIX)
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percent-decoded value of the first `name=` pair in a query string.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| {
            percent_decode_str(&value.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned()
        })
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

/// Result of handing one payload to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Session not open or its receiver is gone
    Skipped,
    /// Queue full; caller decides the overflow policy
    Overflow,
}

/// One live transport connection as seen by the fanout.
pub struct ClientSession {
    id: SessionId,
    identity: UserIdentity,
    addr: Option<SocketAddr>,
    state: AtomicU8,
    outbound: mpsc::Sender<Arc<str>>,
    evicted: Notify,
}

impl ClientSession {
    /// Create a session in `Connecting` with a bounded outbound queue.
    pub fn new(
        identity: UserIdentity,
        addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: SessionId::new(),
            identity,
            addr,
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound,
            evicted: Notify::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// `Connecting → Open`. Has no effect once closed.
    pub fn open(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn close(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Non-blocking enqueue. Never waits on a slow socket.
    pub fn deliver(&self, payload: Arc<str>) -> Delivery {
        if !self.is_open() {
            return Delivery::Skipped;
        }
        match self.outbound.try_send(payload) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Skipped,
        }
    }

    /// Close the session and wake its connection task.
    pub fn evict(&self) {
        self.close();
        self.evicted.notify_one();
    }

    /// Resolves once `evict` has been called (a prior call is remembered).
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Concurrency-safe set of sessions, keyed by connection handle.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.write().await;
        log::debug!("Registered session {} ({})", session.id(), session.identity());
        sessions.insert(session.id(), session);
    }

    /// Remove and close a session. Safe to call more than once.
    pub async fn unregister(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(ref session) = removed {
            session.close();
            log::debug!("Unregistered session {} ({})", session.id(), session.identity());
        }
        removed
    }

    /// Sessions currently in `Open`. The result is a point-in-time copy.
    pub async fn list_live(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Number of sessions registered under `identity`.
    pub async fn count_identity(&self, identity: &UserIdentity) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.identity() == identity)
            .count()
    }
}
