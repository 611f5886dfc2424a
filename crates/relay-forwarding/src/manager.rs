//! Routing: which nodes get a message, and how a bulk call is split into
//! per-node work.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use relay_core::{DropNotifier, Outcome, RelayMessage, RetryPolicy, SerializedMessage};
use relay_persistence::{ErrorQueue, QueueState, SpillLedger};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config::{ForwardingConfig, TopologyConfig};
use crate::error::ForwardError;
use crate::node::Node;
use crate::topology::{BuildContext, HostTable, Topology};
use crate::transport::TransportFactory;

/// How a node handles the one-way messages routed to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub sync_in_messages: bool,
    pub skip_error_queue_for_sync: bool,
}

/// The work for one node in a bulk call.
#[derive(Debug)]
pub struct NodeBundle {
    pub node: Arc<Node>,
    pub info: NodeInfo,
    /// Encoded one-way messages.
    pub in_messages: Vec<SerializedMessage>,
    /// Indexes into the caller's message list of two-way messages.
    pub out_messages: Vec<usize>,
    /// Nodes this bundle has already been sent to.
    pub attempted: Vec<Arc<Node>>,
}

/// Per-node bundles for one pass of a bulk call.
#[derive(Debug, Default)]
pub struct Distribution {
    bundles: Vec<NodeBundle>,
}

impl Distribution {
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn bundles(&self) -> &[NodeBundle] {
        &self.bundles
    }

    pub fn bundles_mut(&mut self) -> &mut [NodeBundle] {
        &mut self.bundles
    }

    fn bundle(&mut self, node: &Arc<Node>, info: NodeInfo) -> &mut NodeBundle {
        let index = match self
            .bundles
            .iter()
            .position(|b| Arc::ptr_eq(&b.node, node) && b.info == info)
        {
            Some(index) => index,
            None => {
                self.bundles.push(NodeBundle {
                    node: Arc::clone(node),
                    info,
                    in_messages: Vec::new(),
                    out_messages: Vec::new(),
                    attempted: Vec::new(),
                });
                self.bundles.len() - 1
            }
        };
        &mut self.bundles[index]
    }
}

impl IntoIterator for Distribution {
    type Item = NodeBundle;
    type IntoIter = std::vec::IntoIter<NodeBundle>;

    fn into_iter(self) -> Self::IntoIter {
        self.bundles.into_iter()
    }
}

/// Owns the current topology and answers routing questions against it.
pub struct NodeManager {
    topology: RwLock<Arc<Topology>>,
    forwarding: RwLock<ForwardingConfig>,
    ctx: BuildContext,
}

impl NodeManager {
    /// Builds the first topology. Host names are resolved on the calling
    /// thread, which is fine at startup but not once traffic flows; see
    /// [`reload`](Self::reload).
    pub fn new(
        topology: &TopologyConfig,
        forwarding: ForwardingConfig,
        factory: Arc<dyn TransportFactory>,
        dropped: DropNotifier,
        handle: Handle,
    ) -> Result<Self, ForwardError> {
        let ctx = BuildContext {
            factory,
            ledger: Arc::new(SpillLedger::from_mb(forwarding.queue.max_persisted_mb)),
            dropped,
            handle,
        };
        let hosts = HostTable::resolve_blocking(topology);
        let (built, _) = Topology::build(topology, &forwarding, &ctx, &hosts, None)?;
        Ok(Self {
            topology: RwLock::new(Arc::new(built)),
            forwarding: RwLock::new(forwarding),
            ctx,
        })
    }

    /// A snapshot of the current topology.
    pub fn topology(&self) -> Arc<Topology> {
        Arc::clone(&self.topology.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn forwarding(&self) -> ForwardingConfig {
        self.forwarding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn ledger(&self) -> &Arc<SpillLedger> {
        &self.ctx.ledger
    }

    pub fn dropped(&self) -> &DropNotifier {
        &self.ctx.dropped
    }

    /// The nodes `message` must go to. An empty result means the message
    /// is dropped, and the drop has already been reported.
    pub fn get_nodes_for_message(&self, message: &mut RelayMessage) -> Vec<Arc<Node>> {
        let topology = self.topology();
        let nodes = self.route(&topology, message);
        if nodes.is_empty() {
            self.ctx.dropped.notify_message(message);
        }
        nodes
    }

    fn route(&self, topology: &Topology, message: &RelayMessage) -> Vec<Arc<Node>> {
        if message.relay_ttl < 1 || topology.groups().is_empty() {
            return Vec::new();
        }
        if message.is_group_broadcast() {
            return match topology.my_group() {
                // inside the system only our own cluster is our business
                Some(group) => group
                    .my_cluster()
                    .map(|c| c.nodes_for_message(message))
                    .unwrap_or_default(),
                None => topology
                    .groups()
                    .iter()
                    .flat_map(|g| g.nodes_for_message(message))
                    .collect(),
            };
        }
        match topology.group_for_type(message.type_id) {
            Some(group) => group.nodes_for_message(message),
            None => {
                error!(type_id = message.type_id, "no group configured for type");
                Vec::new()
            }
        }
    }

    /// Routes a message for a single dispatch: resolves its nodes, stamps
    /// the history and spends one hop.
    pub fn prepare_message(&self, message: &mut RelayMessage) -> Vec<Arc<Node>> {
        let nodes = self.get_nodes_for_message(message);
        message.relay_ttl = message.relay_ttl.saturating_sub(1);
        if !nodes.is_empty() {
            if let Some(me) = self.topology().my_address() {
                message.add_address_to_history(me);
            }
        }
        nodes
    }

    /// Sync settings for one-way messages of `type_id` sent to `node`.
    /// Clusters that contain this forwarder are always asynchronous.
    pub fn node_info(&self, node: &Node, type_id: i16) -> NodeInfo {
        if node.placement().me_in_cluster {
            return NodeInfo::default();
        }
        self.topology()
            .type_setting(type_id)
            .map(|s| NodeInfo {
                sync_in_messages: s.sync_in_messages,
                skip_error_queue_for_sync: s.skip_error_queue_for_sync,
            })
            .unwrap_or_default()
    }

    pub fn is_cross_zone(&self, node: &Node) -> bool {
        self.topology().is_cross_zone(node)
    }

    /// Sibling retries allowed for a message's group.
    pub fn retry_count_for(&self, message: &RelayMessage) -> u32 {
        self.topology()
            .group_for_type(message.type_id)
            .map_or(0, |g| g.retry_count())
    }

    pub fn retry_policy_for(&self, message: &RelayMessage) -> RetryPolicy {
        self.topology()
            .group_for_type(message.type_id)
            .map(|g| g.retry_policy())
            .unwrap_or_default()
    }

    /// A sibling of `first` to retry on, skipping everything in `tried`.
    pub fn retry_candidate(&self, first: &Arc<Node>, tried: &[Arc<Node>]) -> Option<Arc<Node>> {
        let topology = self.topology();
        topology.cluster_of(first)?.retry_candidate(tried)
    }

    /// Splits a bulk call into per-node bundles.
    ///
    /// One-way messages are encoded once per target set; targets in
    /// another zone get a zone-rewritten copy that is always handled
    /// asynchronously.
    pub fn distribute_messages(&self, messages: &mut [RelayMessage]) -> Distribution {
        let topology = self.topology();
        let mut distribution = Distribution::default();

        for (index, message) in messages.iter_mut().enumerate() {
            let nodes = self.get_nodes_for_message(message);
            if !nodes.is_empty() {
                if let Some(me) = topology.my_address() {
                    message.add_address_to_history(me);
                }
            }
            message.relay_ttl = message.relay_ttl.saturating_sub(1);
            if nodes.is_empty() {
                continue;
            }

            if message.is_two_way() {
                for node in &nodes {
                    distribution
                        .bundle(node, NodeInfo::default())
                        .out_messages
                        .push(index);
                }
                continue;
            }

            message.outcome = Some(Outcome::Queued);
            let (local, foreign): (Vec<_>, Vec<_>) =
                nodes.into_iter().partition(|n| !topology.is_cross_zone(n));

            if !local.is_empty() {
                match SerializedMessage::encode(message) {
                    Ok(serialized) => {
                        for node in &local {
                            let info = self.node_info(node, message.type_id);
                            distribution
                                .bundle(node, info)
                                .in_messages
                                .push(serialized.clone());
                        }
                    }
                    Err(e) => warn!(id = message.id, "message could not be encoded: {e}"),
                }
            }
            if !foreign.is_empty() {
                match SerializedMessage::encode(&message.inter_zone_copy()) {
                    Ok(serialized) => {
                        for node in &foreign {
                            distribution
                                .bundle(node, NodeInfo::default())
                                .in_messages
                                .push(serialized.clone());
                        }
                    }
                    Err(e) => warn!(id = message.id, "message could not be encoded: {e}"),
                }
            }
        }
        distribution
    }

    /// Moves every failed two-way message that may still be retried onto an
    /// untried sibling in its cluster. Retryability is judged per message,
    /// so one bundle can carry both retried and final failures. An empty
    /// result ends the retry loop.
    ///
    /// Each pass adds the current node to a bundle's attempted list, so a
    /// bundle is redistributed at most `retry_count` times.
    pub fn redistribute_retry_messages(
        &self,
        distribution: Distribution,
        messages: &mut [RelayMessage],
    ) -> Distribution {
        let topology = self.topology();
        let mut retries = Distribution::default();

        for mut bundle in distribution {
            if bundle.out_messages.is_empty() {
                continue;
            }
            let Some(group) = topology.group(bundle.node.group()) else {
                continue;
            };
            if bundle.attempted.len() >= group.retry_count() as usize {
                continue;
            }
            // messages with a final error stay behind with it
            let policy = group.retry_policy();
            bundle.out_messages.retain(|&index| messages[index].is_retryable(policy));
            if bundle.out_messages.is_empty() {
                continue;
            }
            bundle.attempted.push(Arc::clone(&bundle.node));
            let Some(retry) = topology
                .cluster_of(&bundle.node)
                .and_then(|c| c.retry_candidate(&bundle.attempted))
            else {
                continue;
            };
            bundle.node = retry;
            for &index in &bundle.out_messages {
                messages[index].reset_for_retry();
            }
            bundle.in_messages.clear();
            retries.bundles.push(bundle);
        }
        retries
    }

    /// Advances every node's health windows.
    pub fn tick(&self) {
        for node in self.topology().nodes() {
            node.tick();
        }
    }

    /// Gives every node a chance to resend part of its error queue.
    pub async fn process_queues(&self) {
        let topology = self.topology();
        for node in topology.nodes() {
            node.process_queue().await;
        }
    }

    /// Hands every node's buffered one-way messages to its transport.
    pub fn flush(&self) {
        for node in self.topology().nodes() {
            node.flush();
        }
    }

    /// Swaps in a new topology. Nodes that survive keep their queues and
    /// health; the backlog of nodes that vanished is dropped.
    pub async fn reload(
        &self,
        topology: &TopologyConfig,
        forwarding: ForwardingConfig,
    ) -> Result<(), ForwardError> {
        topology.validate()?;
        let hosts = HostTable::resolve(topology).await;
        let previous = self.topology();
        let (built, vanished) =
            Topology::build(topology, &forwarding, &self.ctx, &hosts, Some(&previous))?;
        self.ctx.ledger.set_max_bytes(forwarding.queue.max_persisted_mb.saturating_mul(1024 * 1024));

        *self.topology.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(built);
        *self.forwarding.write().unwrap_or_else(|e| e.into_inner()) = forwarding;

        for node in vanished {
            node.flush();
            let dropped = self.ctx.dropped.clone();
            // waits out a running spill, so it stays off the async workers
            let drained = self
                .ctx
                .handle
                .spawn_blocking(move || {
                    drop_backlog(node.group(), node.name(), node.error_queue(), &dropped)
                })
                .await;
            if let Err(e) = drained {
                error!("failed to drop backlog of removed node: {e}");
            }
        }
        Ok(())
    }

    /// Every non-empty error queue, by group and node name.
    pub fn error_queues(&self) -> BTreeMap<String, BTreeMap<String, Arc<ErrorQueue>>> {
        let topology = self.topology();
        let mut queues: BTreeMap<String, BTreeMap<String, Arc<ErrorQueue>>> = BTreeMap::new();
        for node in topology.nodes() {
            if node.error_queue().in_message_count() == 0 {
                continue;
            }
            queues
                .entry(node.group().to_owned())
                .or_default()
                .insert(node.name().to_owned(), Arc::clone(node.error_queue()));
        }
        queues
    }

    /// Moves saved queue contents into the matching live nodes. Queues for
    /// nodes that no longer exist are dropped.
    pub fn populate_queues(
        &self,
        states: BTreeMap<String, BTreeMap<String, QueueState>>,
        increment_counters: bool,
    ) {
        let topology = self.topology();
        for (group, nodes) in states {
            for (name, state) in nodes {
                let old = ErrorQueue::from_state(
                    state,
                    &name,
                    Arc::clone(&self.ctx.ledger),
                    self.ctx.dropped.clone(),
                );
                match topology.find_node(&group, &name) {
                    Some(node) => {
                        let count = old.in_message_count();
                        node.error_queue().populate(&old, increment_counters);
                        if count > 0 {
                            info!(group = %group, node = %name, count, "restored error queue");
                        }
                    }
                    // restored queues never spill, so this can't block
                    None => drop_backlog(&group, &name, &old, &self.ctx.dropped),
                }
            }
        }
    }
}

/// Reports everything left in `queue` as dropped. Blocks until a running
/// spill finishes.
fn drop_backlog(group: &str, node: &str, queue: &ErrorQueue, dropped: &DropNotifier) {
    queue.wait_for_spill();
    let mut count = 0usize;
    while let Some(messages) = queue.dequeue() {
        count += messages.len();
        for message in messages {
            dropped.notify(message);
        }
    }
    if count > 0 {
        warn!(group, node, count, "dropped error queue of removed node");
    }
}
