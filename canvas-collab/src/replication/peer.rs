//! Push replication to another canvas server over WebSocket.
//!
//! Each `PeerBridge` owns one link task. The task connects to
//! `<url>?replica=<key>` and forwards every committed write as a `mirror`
//! message. While the link is down, writes wait in an `OfflineQueue` that
//! drops the oldest entry when full, and the task reconnects with backoff.
//!
//! A peer that does not accept our key serves the link as a viewer and opens
//! with an `init` frame. The link treats that as a rejection: it closes the
//! connection, counts it, and retries at the maximum backoff. Writes sent
//! before the `init` arrived are lost.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Replicated, ReplicationBridge, ReplicationError};
use crate::client::ConnectionState;
use crate::protocol::{ClientMessage, ServerMessage};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Writes held back while a peer is unreachable.
///
/// Holds at most `max_size` events; enqueueing into a full queue evicts the
/// oldest one.
pub struct OfflineQueue {
    queue: VecDeque<Replicated>,
    max_size: usize,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            dropped: 0,
        }
    }

    /// Queue an event. Returns `false` if an older event was evicted for it.
    pub fn enqueue(&mut self, event: Replicated) -> bool {
        let mut kept_all = true;
        if self.queue.len() >= self.max_size {
            self.queue.pop_front();
            self.dropped += 1;
            kept_all = false;
        }
        self.queue.push_back(event);
        kept_all
    }

    /// Put an event back at the front after a failed send.
    pub fn requeue(&mut self, event: Replicated) {
        if self.queue.len() >= self.max_size {
            self.dropped += 1;
            return;
        }
        self.queue.push_front(event);
    }

    pub fn pop(&mut self) -> Option<Replicated> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Events evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Counters shared between the bridge and its link task.
#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    connects: AtomicU64,
    rejected: AtomicU64,
}

/// Bridge that mirrors local commits to one remote canvas server.
pub struct PeerBridge {
    url: String,
    tx: mpsc::Sender<Replicated>,
    state: Arc<RwLock<ConnectionState>>,
    counters: Arc<LinkCounters>,
}

impl PeerBridge {
    /// Start the link task. `url` is the peer's WebSocket endpoint and `key`
    /// must match the peer's configured replica key.
    pub fn spawn(url: impl Into<String>, key: &str, capacity: usize) -> (Self, JoinHandle<()>) {
        let url = url.into();
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let counters = Arc::new(LinkCounters::default());

        let link = PeerLink {
            endpoint: replica_endpoint(&url, key),
            url: url.clone(),
            rx,
            pending: OfflineQueue::new(capacity),
            state: state.clone(),
            counters: counters.clone(),
        };
        let handle = tokio::spawn(link.run());

        (
            Self {
                url,
                tx,
                state,
                counters,
            },
            handle,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Mirror messages written to the peer so far.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Successful connections so far.
    pub fn connects(&self) -> u64 {
        self.counters.connects.load(Ordering::Relaxed)
    }

    /// Connections the peer served as a viewer because it refused our key.
    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }
}

impl ReplicationBridge for PeerBridge {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn publish(&self, event: &Replicated) -> Result<(), ReplicationError> {
        self.tx.try_send(*event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReplicationError::QueueFull { bridge: "peer" },
            mpsc::error::TrySendError::Closed(_) => {
                ReplicationError::SinkUnavailable { bridge: "peer" }
            }
        })
    }
}

/// Build `<url>/?replica=<key>`, keeping any path or query already on `url`.
fn replica_endpoint(url: &str, key: &str) -> String {
    let key = utf8_percent_encode(key, NON_ALPHANUMERIC);
    if url.contains('?') {
        return format!("{url}&replica={key}");
    }
    let has_path = url
        .split_once("://")
        .is_some_and(|(_, rest)| rest.contains('/'));
    if has_path {
        format!("{url}?replica={key}")
    } else {
        format!("{url}/?replica={key}")
    }
}

struct PeerLink {
    url: String,
    endpoint: String,
    rx: mpsc::Receiver<Replicated>,
    pending: OfflineQueue,
    state: Arc<RwLock<ConnectionState>>,
    counters: Arc<LinkCounters>,
}

enum LinkEnd {
    /// Connection dropped; try again
    Lost,
    /// Peer refused the replica key
    Rejected,
    /// Bridge dropped; stop
    Shutdown,
}

impl PeerLink {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            *self.state.write().await = ConnectionState::Connecting;
            match tokio_tungstenite::connect_async(self.endpoint.as_str()).await {
                Ok((ws, _)) => {
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    *self.state.write().await = ConnectionState::Connected;
                    log::info!("Replica link to {} established", self.url);
                    backoff = INITIAL_BACKOFF;
                    match self.pump(ws).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost => log::warn!("Replica link to {} lost", self.url),
                        LinkEnd::Rejected => {
                            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Replica link to {} rejected: peer does not accept our replica key",
                                self.url
                            );
                            backoff = MAX_BACKOFF;
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Replica link to {} failed: {e}", self.url);
                }
            }

            *self.state.write().await = ConnectionState::Reconnecting;
            if self.wait(backoff).await {
                break;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        *self.state.write().await = ConnectionState::Disconnected;
        if !self.pending.is_empty() {
            log::warn!(
                "Replica link to {} closed with {} unsent writes",
                self.url,
                self.pending.len()
            );
        }
    }

    /// Collect writes while waiting to reconnect. Returns `true` once the
    /// bridge is gone and nothing needs to be sent.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if !self.pending.enqueue(event) {
                            log::debug!("Replica queue for {} full, dropped oldest write", self.url);
                        }
                    }
                    None => return true,
                },
            }
        }
    }

    async fn pump<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> LinkEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut writer, mut reader) = ws.split();

        while let Some(event) = self.pending.pop() {
            if !self.send(&mut writer, event).await {
                return LinkEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if !self.send(&mut writer, event).await {
                            return LinkEnd::Lost;
                        }
                    }
                    None => {
                        let _ = writer.send(Message::Close(None)).await;
                        return LinkEnd::Shutdown;
                    }
                },
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ServerMessage::Init { .. }) = ServerMessage::decode(text.as_str()) {
                            let _ = writer.send(Message::Close(None)).await;
                            return LinkEnd::Rejected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return LinkEnd::Lost,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn send<W>(&mut self, writer: &mut W, event: Replicated) -> bool
    where
        W: futures_util::Sink<Message> + Unpin,
    {
        let text = match ClientMessage::Mirror(event).encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode mirror message: {e}");
                return true;
            }
        };
        if writer.send(Message::text(text)).await.is_err() {
            self.pending.requeue(event);
            return false;
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        true
    }
}
