//! Server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::WireFormat;
use crate::storage::StorageFormat;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path the WebSocket handshake must target
    pub endpoint_path: String,
    /// Pause between sending the init snapshot and reading client frames.
    /// Gives slow microcontroller clients time to render the snapshot.
    pub startup_delay: Duration,
    /// Encoding of the init snapshot
    pub init_format: WireFormat,
    /// Outbound frames buffered per peer before broadcasts to it are dropped
    pub outbound_capacity: usize,
    /// Snapshot file (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Snapshot file encoding
    pub storage_format: StorageFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            endpoint_path: "/api/ws/canvas".to_string(),
            startup_delay: Duration::from_secs(1),
            init_format: WireFormat::Text,
            outbound_capacity: 256,
            storage_path: Some(PathBuf::from("canvas_state.json")),
            storage_format: StorageFormat::Json,
        }
    }
}

impl ServerConfig {
    /// In-memory config on `bind_addr` with no startup delay.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            startup_delay: Duration::ZERO,
            outbound_capacity: 64,
            storage_path: None,
            ..Self::default()
        }
    }

    /// Defaults overridden by `CANVAS_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Values that do not parse are logged
    /// and the previous setting is kept.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("CANVAS_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("CANVAS_ENDPOINT_PATH") {
            self.endpoint_path = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CANVAS_STARTUP_DELAY_MS") {
            self.startup_delay = Duration::from_millis(ms);
        }
        if let Some(format) = parse_var(&lookup, "CANVAS_INIT_FORMAT") {
            self.init_format = format;
        }
        if let Some(capacity) = parse_var(&lookup, "CANVAS_OUTBOUND_CAPACITY") {
            self.outbound_capacity = capacity;
        }
        if let Some(v) = lookup("CANVAS_STATE_PATH") {
            // Empty path disables persistence
            self.storage_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(format) = parse_var(&lookup, "CANVAS_STATE_FORMAT") {
            self.storage_format = format;
        }
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring {key}={raw}: {e}");
            None
        }
    }
}
