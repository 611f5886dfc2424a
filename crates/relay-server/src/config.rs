//! Server configuration.
//!
//! One TOML file carries the listener settings plus the forwarder's own
//! `[topology]` and `[forwarding]` sections. Resolution order is
//! defaults → TOML file → env vars → CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_forwarding::{ForwardingConfig, TopologyConfig};
use serde::{Deserialize, Serialize};

/// Default maximum number of concurrent client connections.
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    /// Largest frame accepted from clients or nodes, in KiB.
    pub max_frame_kb: usize,
    /// How long a node gets to answer one request.
    pub node_timeout_ms: u64,
    /// Where error queues are saved on shutdown and restored from on
    /// startup. Empty disables it.
    pub run_state_path: String,
    pub topology: TopologyConfig,
    pub forwarding: ForwardingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7400,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_kb: 10 * 1024,
            node_timeout_ms: 2000,
            run_state_path: String::new(),
            topology: TopologyConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads and parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The frame cap in bytes. Frame lengths go on the wire as a `u32`, so
    /// the cap must fit one.
    pub fn max_frame_bytes(&self) -> Result<usize, String> {
        if self.max_frame_kb == 0 {
            return Err("must be greater than zero".into());
        }
        self.max_frame_kb
            .checked_mul(1024)
            .filter(|&bytes| u32::try_from(bytes).is_ok())
            .ok_or_else(|| format!("{} KiB does not fit a frame length", self.max_frame_kb))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn run_state_path(&self) -> Option<PathBuf> {
        if self.run_state_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.run_state_path))
        }
    }
}
