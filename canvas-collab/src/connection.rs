//! One task per WebSocket connection.
//!
//! A viewer connection moves `Connecting → Open → Closed`:
//! - Connecting: the handshake is read for `user` / `replica` query parameters.
//! - Open: the session is attached (snapshot + registration under the canvas
//!   lock), `init` is sent, then a `select!` multiplexes inbound frames, the
//!   outbound queue, and eviction.
//! - Closed: on transport close, transport error, eviction, or server
//!   shutdown. The session is always detached on the way out.
//!
//! A replica connection (matching `replica=<key>`) gets no snapshot and is
//! never part of the fan-out; it only feeds `mirror` messages to the canvas.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::canvas::{Attached, Canvas, WriteOutcome};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::ServerStats;
use crate::session::{query_param, ClientSession, UserIdentity};

pub type ConnectionError = Box<dyn std::error::Error + Send + Sync>;

type WsError = tokio_tungstenite::tungstenite::Error;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Viewer(UserIdentity),
    Replica,
}

impl Role {
    /// Derive the role from the request query. `replica=<key>` only counts
    /// when a key is configured and matches.
    pub fn from_query(query: Option<&str>, replica_key: Option<&str>) -> Self {
        if let (Some(query), Some(expected)) = (query, replica_key) {
            if let Some(offered) = query_param(query, "replica") {
                if offered == expected {
                    return Role::Replica;
                }
                log::warn!("Rejected replica key; treating connection as a viewer");
            }
        }
        Role::Viewer(UserIdentity::from_query(query))
    }
}

/// Serves WebSocket connections against one canvas.
#[derive(Clone)]
pub struct ConnectionHandler {
    canvas: Arc<Canvas>,
    replica_key: Option<Arc<str>>,
    stats: Arc<RwLock<ServerStats>>,
    /// Flips to `true` when the server shuts down
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        canvas: Arc<Canvas>,
        replica_key: Option<String>,
        stats: Arc<RwLock<ServerStats>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            canvas,
            replica_key: replica_key.map(Arc::from),
            stats,
            shutdown,
        }
    }

    /// Resolves once shutdown is signalled or the server is gone.
    pub async fn stopping(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    /// Run one connection to completion.
    pub async fn handle<S>(&self, stream: S, addr: Option<SocketAddr>) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut query: Option<String> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                query = req.uri().query().map(str::to_owned);
                Ok(resp)
            },
        );
        let ws = tokio::select! {
            ws = handshake => ws?,
            _ = self.stopping() => return Ok(()),
        };

        let role = Role::from_query(query.as_deref(), self.replica_key.as_deref());
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            if role == Role::Replica {
                s.replica_connections += 1;
            }
        }

        let (writer, reader) = ws.split();
        let result = match role {
            Role::Viewer(identity) => self.serve_viewer(identity, addr, writer, reader).await,
            Role::Replica => {
                log::info!("Replica connected from {}", display_addr(addr));
                self.serve_replica(reader).await
            }
        };

        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn serve_viewer<W, R>(
        &self,
        identity: UserIdentity,
        addr: Option<SocketAddr>,
        writer: W,
        reader: R,
    ) -> Result<(), ConnectionError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let attached = self.canvas.attach(identity, addr).await;
        let session = attached.session.clone();
        let result = self.run_viewer(attached, writer, reader).await;
        self.canvas.detach(&session.id()).await;
        result
    }

    async fn run_viewer<W, R>(
        &self,
        attached: Attached,
        mut writer: W,
        mut reader: R,
    ) -> Result<(), ConnectionError>
    where
        W: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let Attached {
            session,
            mut outbound,
            snapshot,
        } = attached;

        let init = ServerMessage::init(&snapshot, self.canvas.palette()).encode()?;
        drop(snapshot);
        writer.send(Message::text(init)).await?;

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_viewer_text(&session, text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.on_viewer_text(&session, text).await,
                        Err(_) => self.malformed(&session, "binary frame is not UTF-8").await,
                    },
                    // Pings are answered by tungstenite itself
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                },
                payload = outbound.recv() => match payload {
                    Some(payload) => writer.send(Message::text(payload.to_string())).await?,
                    None => return Ok(()),
                },
                _ = session.evicted() => {
                    log::info!("Closing evicted session {} ({})", session.id(), session.identity());
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = self.stopping() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn on_viewer_text(&self, session: &ClientSession, text: &str) {
        self.stats.write().await.total_messages += 1;
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => return self.malformed(session, &e.to_string()).await,
        };

        match msg {
            ClientMessage::SetPixel { x, y, color } => {
                match self.canvas.submit(session, x, y, &color, Instant::now()).await {
                    WriteOutcome::Cooldown(remaining) => {
                        let reply = ServerMessage::cooldown(remaining);
                        if let Err(e) = self.canvas.hub().send_to(session, &reply).await {
                            log::error!("Failed to send cooldown to {}: {e}", session.id());
                        }
                    }
                    WriteOutcome::Committed(_) | WriteOutcome::Rejected(_) => {}
                }
            }
            ClientMessage::Mirror(_) => {
                log::warn!("Ignoring mirror message from viewer {}", session.identity());
            }
        }
    }

    async fn malformed(&self, session: &ClientSession, reason: &str) {
        self.stats.write().await.malformed_messages += 1;
        log::debug!("Dropped malformed message from {}: {reason}", session.identity());
    }

    async fn serve_replica<R>(&self, mut reader: R) -> Result<(), ConnectionError>
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = reader.next() => frame,
                _ = self.stopping() => break,
            };
            let Some(frame) = frame else { break };
            let text = match frame? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            self.stats.write().await.total_messages += 1;
            match ClientMessage::decode(text.as_str()) {
                Ok(ClientMessage::Mirror(event)) => {
                    if let Err(e) = self.canvas.apply_remote(&event).await {
                        log::warn!("Ignoring mirrored write #{} from {}: {e}", event.sequence, event.origin);
                    }
                }
                Ok(ClientMessage::SetPixel { .. }) => {
                    log::debug!("Ignoring set_pixel on a replica connection");
                }
                Err(e) => {
                    self.stats.write().await.malformed_messages += 1;
                    log::debug!("Dropped malformed replica message: {e}");
                }
            }
        }
        log::info!("Replica connection closed");
        Ok(())
    }
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "unknown".to_string(), |a| a.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_viewer_with_user() {
        let role = Role::from_query(Some("user=alice"), None);
        assert_eq!(role, Role::Viewer(UserIdentity::new("alice")));
    }

    #[test]
    fn test_role_anonymous_viewer() {
        match Role::from_query(None, Some("key")) {
            Role::Viewer(identity) => assert!(identity.is_anonymous()),
            Role::Replica => panic!("no query must not be a replica"),
        }
    }

    #[test]
    fn test_role_replica_requires_matching_key() {
        assert_eq!(Role::from_query(Some("replica=key"), Some("key")), Role::Replica);
        assert!(matches!(
            Role::from_query(Some("replica=wrong&user=bob"), Some("key")),
            Role::Viewer(_)
        ));
        // Without a configured key nobody is a replica
        assert!(matches!(Role::from_query(Some("replica=key"), None), Role::Viewer(_)));
    }

    #[test]
    fn test_display_addr() {
        assert_eq!(display_addr(None), "unknown");
        let addr: SocketAddr = "127.0.0.1:10000".parse().unwrap();
        assert_eq!(display_addr(Some(addr)), "127.0.0.1:10000");
    }
}
