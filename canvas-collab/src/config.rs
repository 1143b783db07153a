//! Server configuration, read from the environment.
//!
//! | Variable                   | Default     |
//! |----------------------------|-------------|
//! | `CANVAS_HOST`              | `0.0.0.0`   |
//! | `CANVAS_PORT` / `PORT`     | `10000`     |
//! | `CANVAS_WIDTH`             | `1000`      |
//! | `CANVAS_HEIGHT`            | `1000`      |
//! | `CANVAS_COOLDOWN_MS`       | `5000`      |
//! | `CANVAS_PALETTE`           | 18 colors   |
//! | `CANVAS_OUTBOUND_CAPACITY` | `256`       |
//! | `CANVAS_ECHO_ORIGIN`       | `true`      |
//! | `CANVAS_STORAGE_PATH`      | unset       |
//! | `CANVAS_SNAPSHOT_EVERY`    | `1000`      |
//! | `CANVAS_REPLICA_PEERS`     | unset       |
//! | `CANVAS_REPLICA_KEY`       | unset       |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::grid::{Palette, PaletteError, MAX_CELLS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to (0 picks a free port)
    pub port: u16,
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Minimum time between accepted writes per identity
    pub cooldown: Duration,
    /// Allowed colors
    pub palette: Palette,
    /// Outbound queue bound per session
    pub outbound_capacity: usize,
    /// Deliver a commit to the session that wrote it
    pub echo_to_origin: bool,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Pixels between persisted snapshots
    pub snapshot_every: u64,
    /// WebSocket URLs of replicas to mirror commits to
    pub replica_peers: Vec<String>,
    /// Key that admits inbound replica connections (None = no replicas)
    pub replica_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10000,
            width: 1000,
            height: 1000,
            cooldown: Duration::from_millis(5000),
            palette: Palette::default(),
            outbound_capacity: 256,
            echo_to_origin: true,
            storage_path: None,
            snapshot_every: 1000,
            replica_peers: Vec::new(),
            replica_key: None,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("CANVAS_HOST") {
            config.host = host.trim().to_string();
        }
        if let Some(port) = get("CANVAS_PORT").map(|v| ("CANVAS_PORT", v)).or_else(|| get("PORT").map(|v| ("PORT", v))) {
            config.port = parse(port.0, &port.1)?;
        }
        if let Some(v) = get("CANVAS_WIDTH") {
            config.width = parse("CANVAS_WIDTH", &v)?;
        }
        if let Some(v) = get("CANVAS_HEIGHT") {
            config.height = parse("CANVAS_HEIGHT", &v)?;
        }
        if let Some(v) = get("CANVAS_COOLDOWN_MS") {
            config.cooldown = Duration::from_millis(parse("CANVAS_COOLDOWN_MS", &v)?);
        }
        if let Some(v) = get("CANVAS_PALETTE") {
            config.palette = Palette::parse_list(&v).map_err(ConfigError::Palette)?;
        }
        if let Some(v) = get("CANVAS_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse("CANVAS_OUTBOUND_CAPACITY", &v)?;
        }
        if let Some(v) = get("CANVAS_ECHO_ORIGIN") {
            config.echo_to_origin = parse_bool("CANVAS_ECHO_ORIGIN", &v)?;
        }
        if let Some(v) = get("CANVAS_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("CANVAS_SNAPSHOT_EVERY") {
            config.snapshot_every = parse("CANVAS_SNAPSHOT_EVERY", &v)?;
        }
        if let Some(v) = get("CANVAS_REPLICA_PEERS") {
            config.replica_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("CANVAS_REPLICA_KEY") {
            config.replica_key = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(invalid("CANVAS_WIDTH", self.width, "must be greater than 0"));
        }
        if self.height == 0 {
            return Err(invalid("CANVAS_HEIGHT", self.height, "must be greater than 0"));
        }
        if self.width as u64 * self.height as u64 > MAX_CELLS {
            return Err(invalid(
                "CANVAS_WIDTH",
                self.width,
                &format!("{}x{} exceeds {MAX_CELLS} cells", self.width, self.height),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(invalid("CANVAS_OUTBOUND_CAPACITY", 0, "must be greater than 0"));
        }
        if self.snapshot_every == 0 {
            return Err(invalid("CANVAS_SNAPSHOT_EVERY", 0, "must be greater than 0"));
        }
        for peer in &self.replica_peers {
            if !(peer.starts_with("ws://") || peer.starts_with("wss://")) {
                return Err(invalid("CANVAS_REPLICA_PEERS", peer, "expected ws:// or wss:// URL"));
            }
        }
        if !self.replica_peers.is_empty() && self.replica_key.is_none() {
            return Err(invalid(
                "CANVAS_REPLICA_KEY",
                "",
                "required when CANVAS_REPLICA_PEERS is set",
            ));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Small in-memory canvas on a free loopback port, without cooldown.
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            width: 16,
            height: 16,
            cooldown: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds an unusable value
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    /// `CANVAS_PALETTE` could not be parsed
    Palette(PaletteError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "Invalid {var}={value:?}: {reason}")
            }
            ConfigError::Palette(e) => write!(f, "Invalid CANVAS_PALETTE: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Palette(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}

fn invalid(var: &'static str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, value, &e.to_string()))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}
