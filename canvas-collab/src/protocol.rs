//! JSON wire protocol.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! server → client   {"type":"init","width":W,"height":H,"palette":[..],"pixels":"<base64>"}
//! client → server   {"type":"set_pixel","x":1,"y":2,"color":5}        (or "color":"#ff0000")
//! server → client   {"type":"pixel","x":1,"y":2,"color":5}
//! server → client   {"type":"cooldown","remainingMillis":4210}
//! replica → server  {"type":"mirror","origin":"<uuid>","sequence":7,"x":1,"y":2,"color":5}
//! ```
//!
//! `pixels` is the grid buffer, one byte per cell, row-major: 0 is unset and
//! `n` is palette entry `n` (1-based).

use std::time::Duration;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::cooldown::ceil_millis;
use crate::grid::{ColorValue, Committed, GridError, GridSnapshot, Palette};
use crate::replication::Replicated;

/// Color as sent by a client: a palette code or a palette hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireColor {
    Code(u64),
    Hex(String),
}

impl WireColor {
    pub fn resolve(&self, palette: &Palette) -> Result<ColorValue, GridError> {
        match self {
            WireColor::Code(code) => palette.by_code(*code),
            WireColor::Hex(hex) => palette.by_hex(hex),
        }
    }
}

impl From<u8> for WireColor {
    fn from(code: u8) -> Self {
        WireColor::Code(code as u64)
    }
}

impl From<&str> for WireColor {
    fn from(hex: &str) -> Self {
        WireColor::Hex(hex.to_string())
    }
}

/// Messages a server accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Write request. Coordinates are signed so that negative input decodes
    /// and is rejected as out of bounds rather than as malformed.
    SetPixel { x: i64, y: i64, color: WireColor },
    /// Commit forwarded by another replica
    Mirror(Replicated),
}

impl ClientMessage {
    pub fn set_pixel(x: i64, y: i64, color: impl Into<WireColor>) -> Self {
        ClientMessage::SetPixel {
            x,
            y,
            color: color.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Messages a server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full grid, once per connection
    Init {
        width: u32,
        height: u32,
        palette: Vec<String>,
        pixels: String,
    },
    /// One committed write
    Pixel { x: u32, y: u32, color: u8 },
    /// Write refused by the rate limiter, sent to the requester only
    Cooldown {
        #[serde(rename = "remainingMillis")]
        remaining_millis: u64,
    },
}

impl ServerMessage {
    pub fn init(snapshot: &GridSnapshot, palette: &Palette) -> Self {
        ServerMessage::Init {
            width: snapshot.width,
            height: snapshot.height,
            palette: palette.colors().to_vec(),
            pixels: BASE64.encode(&snapshot.cells),
        }
    }

    pub fn pixel(committed: &Committed) -> Self {
        ServerMessage::Pixel {
            x: committed.x,
            y: committed.y,
            color: committed.color.code(),
        }
    }

    pub fn cooldown(remaining: Duration) -> Self {
        ServerMessage::Cooldown {
            remaining_millis: ceil_millis(remaining),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Decode the `pixels` field of an `init` message into a snapshot.
    pub fn snapshot(&self) -> Result<GridSnapshot, ProtocolError> {
        match self {
            ServerMessage::Init { width, height, pixels, .. } => {
                let cells = BASE64
                    .decode(pixels)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                if cells.len() as u64 != *width as u64 * *height as u64 {
                    return Err(ProtocolError::DeserializationError(format!(
                        "init carries {} cells for a {width}x{height} grid",
                        cells.len()
                    )));
                }
                Ok(GridSnapshot {
                    width: *width,
                    height: *height,
                    cells,
                })
            }
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::replication::ReplicaId;

    #[test]
    fn test_decode_set_pixel_numeric() {
        let msg = ClientMessage::decode(r#"{"type":"set_pixel","x":1,"y":2,"color":5}"#).unwrap();
        assert_eq!(msg, ClientMessage::set_pixel(1, 2, 5u8));
    }

    #[test]
    fn test_decode_set_pixel_hex() {
        let msg =
            ClientMessage::decode(r##"{"type":"set_pixel","x":0,"y":0,"color":"#ff0000"}"##).unwrap();
        match msg {
            ClientMessage::SetPixel { color, .. } => {
                assert_eq!(color.resolve(&Palette::default()), Ok(ColorValue::Color(5)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_negative_coordinates_decode() {
        let msg = ClientMessage::decode(r#"{"type":"set_pixel","x":-3,"y":2,"color":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::set_pixel(-3, 2, 1u8));
    }

    #[test]
    fn test_malformed_messages_rejected() {
        for raw in [
            "",
            "not json",
            "[]",
            r#"{"type":"set_pixel","x":1}"#,
            r#"{"type":"unknown","x":1,"y":1,"color":1}"#,
            r#"{"x":1,"y":1,"color":1}"#,
            r#"{"type":"set_pixel","x":"a","y":1,"color":1}"#,
            r#"{"type":"set_pixel","x":1,"y":1,"color":-4}"#,
            r#"{"type":"set_pixel","x":1,"y":1,"color":null}"#,
        ] {
            assert!(ClientMessage::decode(raw).is_err(), "should reject {raw:?}");
        }
    }

    #[test]
    fn test_mirror_message_shape() {
        let origin = ReplicaId::new();
        let ev = Replicated { origin, sequence: 7, x: 1, y: 2, color: 5 };
        let json = ClientMessage::Mirror(ev).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "mirror");
        assert_eq!(value["origin"], origin.as_uuid().to_string());
        assert_eq!(value["sequence"], 7);
        assert_eq!(ClientMessage::decode(&json).unwrap(), ClientMessage::Mirror(ev));
    }

    #[test]
    fn test_pixel_message_shape() {
        let committed = Committed { x: 1, y: 2, color: ColorValue::Color(5) };
        let json = ServerMessage::pixel(&committed).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"type": "pixel", "x": 1, "y": 2, "color": 5}));
    }

    #[test]
    fn test_cooldown_message_shape() {
        let json = ServerMessage::cooldown(Duration::from_micros(4_999_500)).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, serde_json::json!({"type": "cooldown", "remainingMillis": 5000}));
    }

    #[test]
    fn test_init_carries_full_grid() {
        let mut grid = Grid::new(4, 4, Palette::default()).unwrap();
        grid.apply_write(1, 2, ColorValue::Color(5)).unwrap();
        let snapshot = grid.snapshot();

        let msg = ServerMessage::init(&snapshot, grid.palette());
        let json = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["width"], 4);
        assert_eq!(value["height"], 4);
        assert_eq!(value["palette"].as_array().unwrap().len(), 18);

        let decoded = ServerMessage::decode(&json).unwrap().snapshot().unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.get(1, 2), Some(ColorValue::Color(5)));
    }

    #[test]
    fn test_init_with_wrong_cell_count() {
        let msg = ServerMessage::Init {
            width: 4,
            height: 4,
            palette: Vec::new(),
            pixels: BASE64.encode([0u8; 3]),
        };
        assert!(msg.snapshot().is_err());
        assert!(matches!(
            ServerMessage::Pixel { x: 0, y: 0, color: 1 }.snapshot(),
            Err(ProtocolError::InvalidMessageType)
        ));
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(ProtocolError::InvalidMessageType.to_string(), "Invalid message type");
        assert_eq!(
            ProtocolError::DeserializationError("eof".into()).to_string(),
            "Deserialization error: eof"
        );
    }
}
