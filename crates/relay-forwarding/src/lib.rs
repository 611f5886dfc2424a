//! relay-forwarding: routes cache messages to replica nodes.
//!
//! The [`Forwarder`] is the entry point. It asks the [`NodeManager`] which
//! nodes a message belongs to, hands one-way messages to each node's batch
//! buffer (falling back to the node's error queue when the node is
//! unhealthy) and sends two-way messages to a single node, retrying on
//! siblings when the group allows it. Node health is a small circuit
//! breaker fed by classified transport faults.

pub mod config;
mod error;
mod forwarder;
pub mod health;
pub mod manager;
pub mod node;
pub mod status;
pub mod topology;
pub mod transport;

pub use config::{
    ClusterDefinition, ForwardingConfig, GroupDefinition, HealthConfig, NodeDefinition,
    QueueConfig, TopologyConfig, TypeSetting, ZoneDefinition,
};
pub use error::ForwardError;
pub use forwarder::Forwarder;
pub use health::NodeHealth;
pub use manager::NodeManager;
pub use node::Node;
pub use status::{ForwarderStatus, NodeStatus};
pub use topology::{HostTable, NodeCluster, NodeGroup, Topology, ZoneTable};
pub use transport::{NullTransport, Transport, TransportFactory};
