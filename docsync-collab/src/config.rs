//! Process configuration read from the environment.
//!
//! | Variable           | Default                 | Meaning                              |
//! |--------------------|-------------------------|--------------------------------------|
//! | `PORT`             | `4000`                  | HTTP port                            |
//! | `WS_PORT`          | `4001`                  | realtime WebSocket port              |
//! | `HOST`             | `127.0.0.1`             | bind host for both listeners         |
//! | `FRONTEND_ORIGIN`  | `http://localhost:5173` | comma-separated origin allowlist     |
//! | `RELAY_URL`        | unset                   | sequencer relay; enables sequencing  |
//! | `SEQUENCING_TOPIC` | `workspace:ops`         | topic on the relay                   |
//! | `STORE_PATH`       | unset                   | RocksDB directory; else in-memory    |
//! | `OUTBOX_CAPACITY`  | `256`                   | per-connection outbox bound          |
//! | `RELAY_ADDR`       | `127.0.0.1:6380`        | relay bind address (relay binary)    |

use std::collections::HashMap;
use std::path::PathBuf;

use crate::sequencing::{RelayConfig, DEFAULT_TOPIC};

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a number, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Realtime WebSocket port
    pub ws_port: u16,
    /// Allowed browser origins; `*` allows any
    pub allowed_origins: Vec<String>,
    /// Sequencer relay base URL (None = single-process mode)
    pub relay_url: Option<String>,
    pub sequencing_topic: String,
    /// RocksDB directory (None = in-memory store)
    pub store_path: Option<PathBuf>,
    /// Updates buffered per connection before drops
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            ws_port: 4001,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            relay_url: None,
            sequencing_topic: DEFAULT_TOPIC.to_string(),
            store_path: None,
            outbox_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Read from explicit key/value pairs. Unset keys keep their defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let mut config = Self::default();
        if let Some(host) = get("HOST") {
            config.host = host.to_string();
        }
        if let Some(port) = get("PORT") {
            config.port = parse_number("PORT", port)?;
        }
        if let Some(port) = get("WS_PORT") {
            config.ws_port = parse_number("WS_PORT", port)?;
        }
        if let Some(origins) = get("FRONTEND_ORIGIN") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
            if config.allowed_origins.is_empty() {
                return Err(ConfigError::Empty {
                    name: "FRONTEND_ORIGIN",
                });
            }
        }
        config.relay_url = get("RELAY_URL").map(String::from);
        if let Some(topic) = get("SEQUENCING_TOPIC") {
            config.sequencing_topic = topic.to_string();
        }
        config.store_path = get("STORE_PATH").map(PathBuf::from);
        if let Some(capacity) = get("OUTBOX_CAPACITY") {
            config.outbox_capacity = parse_number("OUTBOX_CAPACITY", capacity)?;
        }
        Ok(config)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }

    /// Whether a handshake from `origin` may proceed. A missing header
    /// (non-browser client) is allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed == origin),
        }
    }
}

impl RelayConfig {
    /// Read `RELAY_ADDR` from the process environment.
    pub fn from_env() -> Self {
        match std::env::var("RELAY_ADDR") {
            Ok(addr) if !addr.trim().is_empty() => Self {
                bind_addr: addr.trim().to_string(),
            },
            _ => Self::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}
