//! WebSocket client for the canvas protocol.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - `set_pixel` requests
//! - Decoded server events (`init`, `pixel`, `cooldown`) on a channel
//!
//! Used by the integration tests and by tooling; a rendering front end only
//! needs the same wire protocol.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::grid::GridSnapshot;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireColor};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// Full grid received on connect
    Init {
        snapshot: GridSnapshot,
        palette: Vec<String>,
    },
    /// A committed write
    Pixel { x: u32, y: u32, color: u8 },
    /// Our write was refused by the rate limiter
    Cooldown { remaining_millis: u64 },
}

impl CanvasEvent {
    fn from_message(msg: ServerMessage) -> Result<Self, ProtocolError> {
        Ok(match msg {
            ServerMessage::Init { ref palette, .. } => CanvasEvent::Init {
                snapshot: msg.snapshot()?,
                palette: palette.clone(),
            },
            ServerMessage::Pixel { x, y, color } => CanvasEvent::Pixel { x, y, color },
            ServerMessage::Cooldown { remaining_millis } => CanvasEvent::Cooldown { remaining_millis },
        })
    }
}

/// The canvas client.
pub struct CanvasClient {
    /// Identity sent as the `user` query parameter
    user: Option<String>,
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<CanvasEvent>>,
    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<CanvasEvent>,
    /// Server URL
    server_url: String,
}

impl CanvasClient {
    pub fn new(server_url: impl Into<String>, user: Option<&str>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            user: user.map(str::to_string),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CanvasEvent>> {
        self.event_rx.take()
    }

    /// URL including the `user` query parameter.
    pub fn connect_url(&self) -> String {
        match &self.user {
            Some(user) => format!(
                "{}/?user={}",
                self.server_url.trim_end_matches('/'),
                utf8_percent_encode(user, NON_ALPHANUMERIC)
            ),
            None => self.server_url.clone(),
        }
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.connect_url()).await {
            Ok(connected) => connected,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close when it ends
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CanvasEvent::Connected).await;

        // Reader task: decode server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerMessage::decode(text.as_str()).and_then(CanvasEvent::from_message) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring server message: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CanvasEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Request a write.
    pub async fn set_pixel(&self, x: i64, y: i64, color: impl Into<WireColor>) -> Result<(), ProtocolError> {
        let text = ClientMessage::set_pixel(x, y, color).encode()?;
        self.send_raw(text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(text.into())
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        // Dropping the sender ends the writer task, which sends a Close frame
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CanvasClient::new("ws://localhost:10000", Some("alice"));
        assert_eq!(client.user(), Some("alice"));
        assert_eq!(client.server_url(), "ws://localhost:10000");
    }

    #[test]
    fn test_connect_url_encodes_user() {
        let client = CanvasClient::new("ws://localhost:10000/", Some("a b&c"));
        assert_eq!(client.connect_url(), "ws://localhost:10000/?user=a%20b%26c");

        let anonymous = CanvasClient::new("ws://localhost:10000", None);
        assert_eq!(anonymous.connect_url(), "ws://localhost:10000");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CanvasClient::new("ws://localhost:10000", None);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_set_pixel_offline_fails() {
        let client = CanvasClient::new("ws://localhost:10000", None);
        assert!(matches!(
            client.set_pixel(0, 0, 1u8).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = CanvasClient::new("ws://127.0.0.1:9", None);
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_event_from_message() {
        let event = CanvasEvent::from_message(ServerMessage::Cooldown { remaining_millis: 12 }).unwrap();
        assert_eq!(event, CanvasEvent::Cooldown { remaining_millis: 12 });
        let event = CanvasEvent::from_message(ServerMessage::Pixel { x: 1, y: 2, color: 3 }).unwrap();
        assert_eq!(event, CanvasEvent::Pixel { x: 1, y: 2, color: 3 });
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = CanvasClient::new("ws://localhost:10000", None);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
