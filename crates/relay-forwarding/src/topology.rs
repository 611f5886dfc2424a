//! The shape of the cache cluster: zones, groups, clusters and nodes.
//!
//! A [`Topology`] is immutable once built. Reloading builds a new one,
//! carrying over the nodes that survive so their queues and health stay
//! intact.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use rand::Rng;
use relay_core::{DropNotifier, RelayMessage, RetryPolicy};
use relay_persistence::{ErrorQueue, SpillLedger};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{
    ForwardingConfig, GroupDefinition, NodeDefinition, TopologyConfig, TypeSetting,
    ZoneDefinition,
};
use crate::error::ForwardError;
use crate::node::{Node, NodeContext, Placement};
use crate::transport::{NullTransport, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subnet {
    network: u32,
    mask: u32,
}

impl Subnet {
    fn parse(s: &str) -> Result<Self, ForwardError> {
        let invalid = || ForwardError::InvalidConfig(format!("invalid subnet '{s}'"));
        let (addr, bits) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
        let bits: u32 = bits.trim().parse().map_err(|_| invalid())?;
        if bits > 32 {
            return Err(invalid());
        }
        let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
        Ok(Self {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

/// Maps addresses to zones by subnet. First match wins.
#[derive(Debug, Clone, Default)]
pub struct ZoneTable {
    entries: Vec<(u16, Subnet)>,
}

impl ZoneTable {
    pub fn parse(zones: &[ZoneDefinition]) -> Result<Self, ForwardError> {
        let entries = zones
            .iter()
            .map(|z| Ok((z.zone, Subnet::parse(&z.subnet)?)))
            .collect::<Result<Vec<_>, ForwardError>>()?;
        Ok(Self { entries })
    }

    /// The zone of `ip`, or 0 if no subnet contains it.
    pub fn zone_for(&self, ip: IpAddr) -> u16 {
        let IpAddr::V4(v4) = ip else {
            return 0;
        };
        self.entries
            .iter()
            .find(|(_, subnet)| subnet.contains(v4))
            .map_or(0, |(zone, _)| *zone)
    }
}

/// Addresses of a config's node hosts, looked up before a build so that
/// building a topology never waits on DNS. Literal IPs need no lookup.
#[derive(Debug, Default, Clone)]
pub struct HostTable {
    resolved: HashMap<(String, u16), IpAddr>,
}

impl HostTable {
    /// Looks up every named host without blocking the runtime.
    pub async fn resolve(config: &TopologyConfig) -> Self {
        let mut table = Self::default();
        for (host, port) in named_hosts(config) {
            let found = tokio::net::lookup_host((host, port)).await;
            table.record(host, port, found);
        }
        table
    }

    /// Looks up every named host on the calling thread. Meant for startup,
    /// before any traffic is served.
    pub fn resolve_blocking(config: &TopologyConfig) -> Self {
        let mut table = Self::default();
        for (host, port) in named_hosts(config) {
            let found = (host, port).to_socket_addrs();
            table.record(host, port, found);
        }
        table
    }

    fn record(
        &mut self,
        host: &str,
        port: u16,
        found: io::Result<impl Iterator<Item = SocketAddr>>,
    ) {
        match found.map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => {
                self.resolved.insert((host.to_owned(), port), addr.ip());
            }
            Ok(None) => warn!(host, "node host resolved to no addresses"),
            Err(e) => warn!(host, "could not resolve node host: {e}"),
        }
    }

    /// The address of `host`, if it's a literal IP or was resolved.
    pub fn ip_of(&self, host: &str, port: u16) -> Option<IpAddr> {
        host.parse::<IpAddr>()
            .ok()
            .or_else(|| self.resolved.get(&(host.to_owned(), port)).copied())
    }
}

/// Each distinct non-literal host and port in `config`.
fn named_hosts(config: &TopologyConfig) -> Vec<(&str, u16)> {
    let mut hosts: Vec<(&str, u16)> = config
        .groups
        .iter()
        .flat_map(|g| &g.clusters)
        .flat_map(|c| &c.nodes)
        .filter(|def| def.host.parse::<IpAddr>().is_err())
        .map(|def| (def.host.as_str(), def.port))
        .collect();
    hosts.sort_unstable();
    hosts.dedup();
    hosts
}

/// Replicas of one another.
#[derive(Debug)]
pub struct NodeCluster {
    nodes: Vec<Arc<Node>>,
    me_in_cluster: bool,
    local_zone: u16,
}

impl NodeCluster {
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn me_in_cluster(&self) -> bool {
        self.me_in_cluster
    }

    pub fn contains(&self, node: &Arc<Node>) -> bool {
        self.nodes.iter().any(|n| Arc::ptr_eq(n, node))
    }

    /// The preferred target for two-way messages: the first available node
    /// in the local zone, else any available node, else the first node.
    pub fn chosen_node(&self) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.zone() == self.local_zone && n.is_available())
            .or_else(|| self.nodes.iter().find(|n| n.is_available()))
            .or_else(|| self.nodes.first())
            .cloned()
    }

    /// One-way messages go to every replica except this forwarder; two-way
    /// messages go to the chosen node.
    pub fn nodes_for_message(&self, message: &RelayMessage) -> Vec<Arc<Node>> {
        if message.is_two_way() {
            self.chosen_node().into_iter().collect()
        } else {
            self.nodes.iter().filter(|n| !n.is_local()).cloned().collect()
        }
    }

    /// A random available node in the local zone that hasn't been tried.
    pub fn retry_candidate(&self, tried: &[Arc<Node>]) -> Option<Arc<Node>> {
        let candidates: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.zone() == self.local_zone)
            .filter(|n| !tried.iter().any(|t| Arc::ptr_eq(t, n)))
            .filter(|n| n.is_available())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::rng().random_range(0..candidates.len());
        Some(Arc::clone(candidates[pick]))
    }
}

/// A named set of clusters.
#[derive(Debug)]
pub struct NodeGroup {
    definition: GroupDefinition,
    clusters: Vec<NodeCluster>,
    my_cluster: Option<usize>,
}

impl NodeGroup {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn retry_count(&self) -> u32 {
        self.definition.retry_count
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.definition.retry_policy
    }

    pub fn clusters(&self) -> &[NodeCluster] {
        &self.clusters
    }

    /// The cluster this forwarder belongs to, if any.
    pub fn my_cluster(&self) -> Option<&NodeCluster> {
        self.my_cluster.and_then(|i| self.clusters.get(i))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.clusters.iter().flat_map(|c| c.nodes.iter())
    }

    /// Cluster-broadcast messages reach every cluster; everything else is
    /// partitioned by id.
    pub fn nodes_for_message(&self, message: &RelayMessage) -> Vec<Arc<Node>> {
        if self.clusters.is_empty() {
            return Vec::new();
        }
        if message.is_cluster_broadcast() {
            return self
                .clusters
                .iter()
                .flat_map(|c| c.nodes_for_message(message))
                .collect();
        }
        let index = message.id.unsigned_abs() as usize % self.clusters.len();
        self.clusters[index].nodes_for_message(message)
    }

    pub fn cluster_of(&self, node: &Arc<Node>) -> Option<&NodeCluster> {
        self.clusters.iter().find(|c| c.contains(node))
    }
}

/// What building a topology needs from outside.
#[derive(Clone)]
pub struct BuildContext {
    pub factory: Arc<dyn TransportFactory>,
    pub ledger: Arc<SpillLedger>,
    pub dropped: DropNotifier,
    pub handle: Handle,
}

/// A loaded cluster layout.
#[derive(Debug)]
pub struct Topology {
    groups: Vec<NodeGroup>,
    by_type: HashMap<i16, usize>,
    type_settings: HashMap<i16, TypeSetting>,
    my_group: Option<usize>,
    my_address: Option<IpAddr>,
    my_zone: u16,
}

impl Topology {
    /// Builds a topology, reusing the nodes of `previous` that still exist
    /// in the same group. Nodes of `previous` that vanished are returned
    /// alongside so their backlog can be dealt with. Node addresses come
    /// from `hosts`; a host missing there gets a node that never connects.
    pub fn build(
        config: &TopologyConfig,
        forwarding: &ForwardingConfig,
        ctx: &BuildContext,
        hosts: &HostTable,
        previous: Option<&Topology>,
    ) -> Result<(Self, Vec<Arc<Node>>), ForwardError> {
        config.validate()?;
        let zones = ZoneTable::parse(&config.zones)?;
        let my_zone = config.my_address.map_or(0, |ip| zones.zone_for(ip));

        let mut reused: Vec<Arc<Node>> = Vec::new();
        let mut groups = Vec::with_capacity(config.groups.len());
        let mut my_group = None;

        for (group_index, group_def) in config.groups.iter().enumerate() {
            let mut clusters = Vec::with_capacity(group_def.clusters.len());
            let mut my_cluster = None;

            for (cluster_index, cluster_def) in group_def.clusters.iter().enumerate() {
                let resolved: Vec<(&NodeDefinition, Option<IpAddr>)> = cluster_def
                    .nodes
                    .iter()
                    .map(|def| (def, hosts.ip_of(&def.host, def.port)))
                    .collect();
                let me_in_cluster = config.my_address.is_some_and(|me| {
                    resolved.iter().any(|(_, ip)| *ip == Some(me))
                });
                if me_in_cluster {
                    my_cluster = Some(cluster_index);
                    my_group = Some(group_index);
                }

                let mut nodes = Vec::with_capacity(resolved.len());
                for (def, ip) in resolved {
                    let zone = if def.zone != 0 {
                        def.zone
                    } else {
                        ip.map_or(0, |ip| zones.zone_for(ip))
                    };
                    let placement = Placement {
                        zone,
                        is_local: ip.is_some() && ip == config.my_address,
                        me_in_cluster,
                    };
                    let existing = previous.and_then(|p| p.find_node(&group_def.name, &def.name()));
                    let node = match existing {
                        Some(node) => {
                            node.reload(def, group_def, placement, forwarding);
                            reused.push(Arc::clone(&node));
                            node
                        }
                        None => {
                            let transport: Arc<dyn Transport> = match ip {
                                Some(_) => ctx.factory.create(def),
                                None => Arc::new(NullTransport),
                            };
                            let error_queue = Arc::new(ErrorQueue::new(
                                &forwarding.queue,
                                &def.name(),
                                Arc::clone(&ctx.ledger),
                                ctx.dropped.clone(),
                            ));
                            Node::new(
                                def,
                                ip,
                                group_def,
                                placement,
                                forwarding,
                                NodeContext {
                                    transport,
                                    error_queue,
                                    handle: ctx.handle.clone(),
                                    dropped: ctx.dropped.clone(),
                                },
                            )
                        }
                    };
                    nodes.push(node);
                }
                clusters.push(NodeCluster {
                    nodes,
                    me_in_cluster,
                    local_zone: my_zone,
                });
            }
            groups.push(NodeGroup {
                definition: group_def.clone(),
                clusters,
                my_cluster,
            });
        }

        let by_name: HashMap<&str, usize> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name(), i))
            .collect();
        let mut by_type = HashMap::new();
        let mut type_settings = HashMap::new();
        for setting in &config.type_settings {
            if let Some(&index) = by_name.get(setting.group.as_str()) {
                by_type.insert(setting.type_id, index);
            }
            type_settings.insert(setting.type_id, setting.clone());
        }

        let vanished = previous
            .map(|p| {
                p.nodes()
                    .filter(|old| !reused.iter().any(|n| Arc::ptr_eq(n, old)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let topology = Self {
            groups,
            by_type,
            type_settings,
            my_group,
            my_address: config.my_address,
            my_zone,
        };
        info!(
            groups = topology.groups.len(),
            nodes = topology.nodes().count(),
            types = topology.by_type.len(),
            zone = my_zone,
            "topology loaded"
        );
        Ok((topology, vanished))
    }

    pub fn groups(&self) -> &[NodeGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// The group that owns `type_id`.
    pub fn group_for_type(&self, type_id: i16) -> Option<&NodeGroup> {
        self.by_type.get(&type_id).and_then(|&i| self.groups.get(i))
    }

    /// The group this forwarder belongs to, if any.
    pub fn my_group(&self) -> Option<&NodeGroup> {
        self.my_group.and_then(|i| self.groups.get(i))
    }

    pub fn type_setting(&self, type_id: i16) -> Option<&TypeSetting> {
        self.type_settings.get(&type_id)
    }

    pub fn my_address(&self) -> Option<IpAddr> {
        self.my_address
    }

    pub fn my_zone(&self) -> u16 {
        self.my_zone
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.groups.iter().flat_map(|g| g.nodes())
    }

    pub fn find_node(&self, group: &str, name: &str) -> Option<Arc<Node>> {
        self.group(group)?
            .nodes()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub fn cluster_of(&self, node: &Arc<Node>) -> Option<&NodeCluster> {
        self.group(node.group())?.cluster_of(node)
    }

    /// True when `node` sits in another zone than this forwarder. Without
    /// a known local address nothing is cross-zone.
    pub fn is_cross_zone(&self, node: &Node) -> bool {
        self.my_address.is_some() && node.zone() != self.my_zone
    }
}
