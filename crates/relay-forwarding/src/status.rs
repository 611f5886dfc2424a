//! Serializable snapshot of the forwarder's view of the cluster.

use std::sync::Arc;

use serde::Serialize;

use crate::node::Node;
use crate::topology::Topology;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwarderStatus {
    pub my_zone: u16,
    pub queue_depth: usize,
    pub persisted_bytes: i64,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub retry_count: u32,
    pub clusters: Vec<ClusterStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub me_in_cluster: bool,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub zone: u16,
    pub activated: bool,
    pub chosen: bool,
    pub danger_zone: bool,
    pub unreachable: bool,
    pub wait_seconds: f64,
    pub unreachable_errors: u64,
    pub server_down_errors: u64,
    pub queue_depth: usize,
    pub queue_files: usize,
    pub discards: u64,
}

impl NodeStatus {
    fn new(node: &Node, chosen: bool) -> Self {
        let health = node.health_snapshot();
        let queue = node.error_queue();
        Self {
            name: node.name().to_owned(),
            host: node.host().to_owned(),
            port: node.port(),
            zone: node.zone(),
            activated: node.is_activated(),
            chosen,
            danger_zone: node.is_danger_zone(),
            unreachable: node.is_unreachable(),
            wait_seconds: health.wait_seconds,
            unreachable_errors: health.unreachable_errors,
            server_down_errors: health.server_down_errors,
            queue_depth: queue.in_message_count(),
            queue_files: queue.file_count(),
            discards: queue.discard_count(),
        }
    }
}

impl ForwarderStatus {
    pub fn new(topology: &Topology, persisted_bytes: i64) -> Self {
        let groups: Vec<GroupStatus> = topology
            .groups()
            .iter()
            .map(|group| GroupStatus {
                name: group.name().to_owned(),
                retry_count: group.retry_count(),
                clusters: group
                    .clusters()
                    .iter()
                    .map(|cluster| {
                        let chosen = cluster.chosen_node();
                        ClusterStatus {
                            me_in_cluster: cluster.me_in_cluster(),
                            nodes: cluster
                                .nodes()
                                .iter()
                                .map(|n| {
                                    let is_chosen = chosen.as_ref().is_some_and(|c| Arc::ptr_eq(c, n));
                                    NodeStatus::new(n, is_chosen)
                                })
                                .collect(),
                        }
                    })
                    .collect(),
            })
            .collect();
        let queue_depth = groups
            .iter()
            .flat_map(|g| &g.clusters)
            .flat_map(|c| &c.nodes)
            .map(|n| n.queue_depth)
            .sum();
        Self {
            my_zone: topology.my_zone(),
            queue_depth,
            persisted_bytes,
            groups,
        }
    }
}
