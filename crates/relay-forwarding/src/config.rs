//! Forwarder configuration.
//!
//! Every struct here deserializes with `#[serde(default)]`, so a config
//! file only has to mention what it changes.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use relay_core::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ForwardError;

pub use relay_persistence::QueueConfig;

/// Tunables for how messages leave the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Batch size of each node's one-way buffer.
    pub message_burst_length: usize,
    /// How long a partial batch may wait, in milliseconds.
    pub message_burst_timeout_ms: u64,
    /// Dispatch per-node two-way lists concurrently in bulk calls.
    pub enable_async_bulk_gets: bool,
    /// Feed async in-lists back through the batch buffer item by item
    /// instead of sending them as one list.
    pub repost_message_lists: bool,
    pub queue: QueueConfig,
    pub health: HealthConfig,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            message_burst_length: 1,
            message_burst_timeout_ms: 500,
            enable_async_bulk_gets: false,
            repost_message_lists: false,
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl ForwardingConfig {
    pub fn message_burst_timeout(&self) -> Duration {
        Duration::from_millis(self.message_burst_timeout_ms)
    }
}

/// Circuit-breaker constants for every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period of the health counters, in milliseconds.
    pub tick_interval_ms: u64,
    pub unreachable_base_wait_secs: u64,
    pub unreachable_max_wait_secs: u64,
    /// Multiplier applied to the wait when it grows.
    pub unreachable_growth_factor: f64,
    /// Unreachable errors within two wait windows that make the wait grow.
    pub unreachable_growth_trigger: u32,
    /// Length of the trailing server-down error window.
    pub server_down_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            unreachable_base_wait_secs: 30,
            unreachable_max_wait_secs: 300,
            unreachable_growth_factor: 1.5,
            unreachable_growth_trigger: 2,
            server_down_window_secs: 30,
        }
    }
}

impl HealthConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn base_wait(&self) -> Duration {
        Duration::from_secs(self.unreachable_base_wait_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.unreachable_max_wait_secs.max(self.unreachable_base_wait_secs))
    }

    /// Number of ticks that cover `window`, never less than one.
    pub fn ticks_for(&self, window: Duration) -> usize {
        let ticks = window.as_millis() / u128::from(self.tick_interval_ms.max(1));
        usize::try_from(ticks).unwrap_or(usize::MAX).max(1)
    }
}

/// Where nodes live and which types go to which group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Address of this forwarder. Used to find the local node, the local
    /// zone and to stamp address history. Unset means "not in the
    /// topology": no cross-zone splitting happens.
    pub my_address: Option<IpAddr>,
    pub zones: Vec<ZoneDefinition>,
    pub groups: Vec<GroupDefinition>,
    pub type_settings: Vec<TypeSetting>,
}

impl TopologyConfig {
    /// Checks names and references that a topology can't be built
    /// without.
    pub fn validate(&self) -> Result<(), ForwardError> {
        let mut groups = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(ForwardError::InvalidConfig("group with empty name".into()));
            }
            if !groups.insert(group.name.as_str()) {
                return Err(ForwardError::InvalidConfig(format!(
                    "duplicate group '{}'",
                    group.name
                )));
            }
            for node in group.clusters.iter().flat_map(|c| &c.nodes) {
                if node.host.is_empty() {
                    return Err(ForwardError::InvalidConfig(format!(
                        "group '{}' has a node without a host",
                        group.name
                    )));
                }
            }
        }
        let mut types = HashSet::new();
        for setting in &self.type_settings {
            if !types.insert(setting.type_id) {
                return Err(ForwardError::InvalidConfig(format!(
                    "type {} is configured twice",
                    setting.type_id
                )));
            }
            if !groups.contains(setting.group.as_str()) {
                return Err(ForwardError::InvalidConfig(format!(
                    "type {} refers to unknown group '{}'",
                    setting.type_id, setting.group
                )));
            }
        }
        Ok(())
    }
}

/// A subnet that belongs to a zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneDefinition {
    pub zone: u16,
    /// IPv4 subnet in `a.b.c.d/n` form.
    pub subnet: String,
}

/// A named set of clusters that owns one or more types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDefinition {
    pub name: String,
    /// Sibling retries for a failed two-way send. 0 disables retry.
    pub retry_count: u32,
    pub retry_policy: RetryPolicy,
    /// Server-down errors in the trailing window that open the circuit.
    pub danger_zone_threshold: u32,
    /// How long after the last server-down error the circuit stays open.
    pub danger_zone_seconds: u64,
    pub clusters: Vec<ClusterDefinition>,
}

impl Default for GroupDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            retry_count: 0,
            retry_policy: RetryPolicy::default(),
            danger_zone_threshold: 10,
            danger_zone_seconds: 30,
            clusters: Vec::new(),
        }
    }
}

impl GroupDefinition {
    pub fn danger_zone_window(&self) -> Duration {
        Duration::from_secs(self.danger_zone_seconds)
    }
}

/// Replicas of one another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterDefinition {
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDefinition {
    pub host: String,
    pub port: u16,
    /// Explicit zone. 0 means "look it up in the zone table".
    pub zone: u16,
    /// Administratively enabled.
    pub activated: bool,
}

impl Default for NodeDefinition {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            zone: 0,
            activated: true,
        }
    }
}

impl NodeDefinition {
    /// The node's name, `host-port`. Also names its spill folder.
    pub fn name(&self) -> String {
        format!("{}-{}", self.host, self.port)
    }
}

/// Per-type routing and handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeSetting {
    pub type_id: i16,
    pub group: String,
    /// Send one-way messages of this type synchronously instead of
    /// batching them.
    pub sync_in_messages: bool,
    /// With `sync_in_messages`, report failures to the caller instead of
    /// queueing them.
    #[serde(alias = "throw_on_sync_failure")]
    pub skip_error_queue_for_sync: bool,
}
