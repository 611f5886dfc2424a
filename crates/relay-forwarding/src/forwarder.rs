//! The entry point for message traffic.
//!
//! Single messages and bulk lists are routed through the [`NodeManager`],
//! sent to their nodes and, for failed two-way sends, retried on siblings
//! while the group's retry budget and policy allow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use relay_core::{DropNotifier, ErrorType, Outcome, RelayMessage, SerializedMessage};
use relay_persistence::QueueState;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{ForwardingConfig, TopologyConfig};
use crate::error::ForwardError;
use crate::manager::{Distribution, NodeInfo, NodeManager};
use crate::node::Node;
use crate::status::ForwarderStatus;
use crate::transport::TransportFactory;

/// Saved error queues, by group and node name.
type RunState = BTreeMap<String, BTreeMap<String, QueueState>>;

/// A node whose in-list was not handled during a bulk call.
#[derive(Debug)]
struct Unhandled {
    node: String,
    info: NodeInfo,
    count: usize,
}

pub struct Forwarder {
    manager: Arc<NodeManager>,
    dropped: DropNotifier,
    handle: Handle,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Forwarder {
    /// Builds a forwarder on the current tokio runtime, restoring error
    /// queues from `run_state` if given.
    pub fn new(
        topology: &TopologyConfig,
        forwarding: ForwardingConfig,
        factory: Arc<dyn TransportFactory>,
        run_state: Option<&[u8]>,
    ) -> Result<Self, ForwardError> {
        let handle = Handle::try_current().map_err(|e| ForwardError::NoRuntime(e.to_string()))?;
        let dropped = DropNotifier::new();
        let manager = Arc::new(NodeManager::new(
            topology,
            forwarding,
            factory,
            dropped.clone(),
            handle.clone(),
        )?);

        if let Some(blob) = run_state {
            let states: RunState =
                bincode::deserialize(blob).map_err(|e| ForwardError::RunState(e.to_string()))?;
            manager.populate_queues(states, true);
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            manager,
            dropped,
            handle,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    /// Subscribes to every message the forwarder gives up on.
    pub fn subscribe_dropped(&self) -> broadcast::Receiver<SerializedMessage> {
        self.dropped.subscribe()
    }

    /// Forwards one message.
    ///
    /// A two-way message is sent to one node and retried on siblings; its
    /// result, good or bad, is left on the message. A one-way message is
    /// buffered for every target node, or sent right away for types
    /// configured for synchronous handling. Only a synchronous failure
    /// on a type that skips the error queue is returned as an error.
    pub async fn handle_message(&self, message: &mut RelayMessage) -> Result<(), ForwardError> {
        metrics::counter!("relay_messages_forwarded_total").increment(1);
        if message.is_two_way() {
            self.handle_out_message(message).await;
            return Ok(());
        }

        let nodes = self.manager.prepare_message(message);
        if nodes.is_empty() {
            message.set_error(ErrorType::NoNodesAvailable);
            return Ok(());
        }

        let serialized = SerializedMessage::encode(message)?;
        let mut inter_zone: Option<SerializedMessage> = None;
        for node in nodes {
            if self.manager.is_cross_zone(&node) {
                if inter_zone.is_none() {
                    inter_zone = Some(SerializedMessage::encode(&message.inter_zone_copy())?);
                }
                if let Some(copy) = &inter_zone {
                    message.outcome.get_or_insert(Outcome::Queued);
                    node.handle_in_message(copy.clone());
                }
                continue;
            }

            let info = self.manager.node_info(&node, message.type_id);
            if info.sync_in_messages {
                let handled = node
                    .handle_in_message_sync(message, true, info.skip_error_queue_for_sync)
                    .await;
                if !handled {
                    return Err(ForwardError::SyncOperationFailure(format!(
                        "node {} failed to handle message {} of type {}",
                        node.name(),
                        message.id,
                        message.type_id
                    )));
                }
            } else {
                message.outcome.get_or_insert(Outcome::Queued);
                node.handle_in_message(serialized.clone());
            }
        }
        Ok(())
    }

    async fn handle_out_message(&self, message: &mut RelayMessage) {
        let node = self.manager.prepare_message(message).into_iter().next();
        match &node {
            Some(node) => {
                node.send_message(message, false, false).await;
            }
            None => message.set_error(ErrorType::NoNodesAvailable),
        }
        self.retry_on_error(message, node).await;
    }

    /// Retries a failed two-way message on untried siblings of the first
    /// node, one at a time, until it succeeds, the error stops being
    /// retryable or the group's retry budget is spent.
    async fn retry_on_error(&self, message: &mut RelayMessage, first: Option<Arc<Node>>) {
        let Some(first) = first else {
            return;
        };
        let policy = self.manager.retry_policy_for(message);
        let mut remaining = self.manager.retry_count_for(message);
        let mut attempted = vec![Arc::clone(&first)];

        while remaining > 0 && message.is_retryable(policy) {
            remaining -= 1;
            let candidate = self.manager.retry_candidate(&first, &attempted);
            message.reset_for_retry();
            match candidate {
                Some(node) => {
                    debug!(node = %node.name(), id = message.id, "retrying on sibling");
                    node.send_message(message, false, false).await;
                    attempted.push(node);
                }
                None => message.set_error(ErrorType::NoNodesAvailable),
            }
        }
    }

    /// Forwards a list of messages.
    ///
    /// The list is split into per-node bundles. One-way sub-lists are
    /// handled node by node; two-way sub-lists are sent one node after
    /// the other, or all at once with `enable_async_bulk_gets`. Failed
    /// two-way bundles are redistributed to siblings until no retry
    /// remains. Synchronous, skip-queue failures are collected across
    /// every node and returned together.
    pub async fn handle_messages(&self, messages: &mut [RelayMessage]) -> Result<(), ForwardError> {
        metrics::counter!("relay_messages_forwarded_total").increment(messages.len() as u64);
        let mut distribution = self.manager.distribute_messages(messages);
        let concurrent =
            self.manager.forwarding().enable_async_bulk_gets && distribution.len() > 1;
        let mut unhandled = Vec::new();

        while !distribution.is_empty() {
            self.handle_in_lists(&mut distribution, &mut unhandled).await;
            if concurrent {
                self.send_out_lists_concurrently(&distribution, messages).await;
            } else {
                self.send_out_lists(&distribution, messages).await;
            }
            distribution = self.manager.redistribute_retry_messages(distribution, messages);
        }

        let failures: Vec<&Unhandled> = unhandled
            .iter()
            .filter(|u| u.info.sync_in_messages && u.info.skip_error_queue_for_sync)
            .collect();
        if !failures.is_empty() {
            let detail = failures
                .iter()
                .map(|u| format!("{} ({} messages)", u.node, u.count))
                .collect::<Vec<_>>()
                .join(", ");
            info!("sync message lists failed: {detail}");
            return Err(ForwardError::SyncOperationFailure(format!(
                "nodes failed to handle messages: {detail}"
            )));
        }
        for u in &unhandled {
            info!(node = %u.node, count = u.count, "message list was not handled");
        }
        Ok(())
    }

    async fn handle_in_lists(&self, distribution: &mut Distribution, unhandled: &mut Vec<Unhandled>) {
        for bundle in distribution.bundles_mut() {
            if bundle.in_messages.is_empty() {
                continue;
            }
            let list = std::mem::take(&mut bundle.in_messages);
            let count = list.len();
            let handled = bundle
                .node
                .handle_in_messages(
                    list,
                    bundle.info.sync_in_messages,
                    bundle.info.skip_error_queue_for_sync,
                )
                .await;
            if !handled {
                unhandled.push(Unhandled {
                    node: bundle.node.name().to_owned(),
                    info: bundle.info,
                    count,
                });
            }
        }
    }

    async fn send_out_lists(&self, distribution: &Distribution, messages: &mut [RelayMessage]) {
        for bundle in distribution.bundles() {
            if bundle.out_messages.is_empty() {
                continue;
            }
            let mut batch = collect(messages, &bundle.out_messages);
            bundle.node.send_out_messages(&mut batch).await;
            restore(messages, &bundle.out_messages, batch);
        }
    }

    async fn send_out_lists_concurrently(
        &self,
        distribution: &Distribution,
        messages: &mut [RelayMessage],
    ) {
        let mut pending = Vec::new();
        for bundle in distribution.bundles() {
            if bundle.out_messages.is_empty() {
                continue;
            }
            let mut batch = collect(messages, &bundle.out_messages);
            let node = Arc::clone(&bundle.node);
            let task = self.handle.spawn(async move {
                node.send_out_messages(&mut batch).await;
                batch
            });
            pending.push((&bundle.out_messages, task));
        }
        for (indexes, task) in pending {
            match task.await {
                Ok(batch) => restore(messages, indexes, batch),
                Err(e) => {
                    error!("bulk send task failed: {e}");
                    for &index in indexes {
                        messages[index].set_error(ErrorType::Unknown);
                    }
                }
            }
        }
    }

    /// Forwards the one-way form of a message: one-way messages as they
    /// are, confirmed writes as their unconfirmed variant. Returns false
    /// for messages that can't be replicated.
    pub async fn replicate(&self, message: &RelayMessage) -> Result<bool, ForwardError> {
        match message.replicate() {
            Some(mut copy) => {
                self.handle_message(&mut copy).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replicates every message that can be. Returns how many were.
    pub async fn replicate_all(&self, messages: &[RelayMessage]) -> Result<usize, ForwardError> {
        let mut copies: Vec<RelayMessage> = messages.iter().filter_map(|m| m.replicate()).collect();
        if copies.is_empty() {
            return Ok(0);
        }
        self.handle_messages(&mut copies).await?;
        Ok(copies.len())
    }

    /// Serializes every non-empty error queue so a restarted process can
    /// pick up where this one left off.
    ///
    /// Blocks while persistent queues finish spilling.
    pub fn run_state(&self) -> Result<Vec<u8>, ForwardError> {
        let states: RunState = self
            .manager
            .error_queues()
            .into_iter()
            .map(|(group, nodes)| {
                let nodes = nodes
                    .into_iter()
                    .map(|(name, queue)| (name, queue.to_state()))
                    .collect();
                (group, nodes)
            })
            .collect();
        bincode::serialize(&states).map_err(|e| ForwardError::RunState(e.to_string()))
    }

    /// Applies a new topology and forwarding config.
    ///
    /// The maintenance intervals keep the values they were started with.
    pub async fn reload(
        &self,
        topology: &TopologyConfig,
        forwarding: ForwardingConfig,
    ) -> Result<(), ForwardError> {
        self.manager.reload(topology, forwarding).await
    }

    /// Starts the health tick and error-queue drain loops.
    pub fn spawn_maintenance(&self) {
        let forwarding = self.manager.forwarding();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let manager = Arc::clone(&self.manager);
        let mut stop = self.shutdown.subscribe();
        let period = forwarding.health.tick_interval();
        tasks.push(self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.tick(),
                    _ = stop.changed() => break,
                }
            }
        }));

        let manager = Arc::clone(&self.manager);
        let mut stop = self.shutdown.subscribe();
        let period = forwarding.queue.dequeue_interval();
        tasks.push(self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.process_queues().await,
                    _ = stop.changed() => break,
                }
            }
        }));
    }

    /// Stops the maintenance loops and flushes every node's buffer.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("maintenance task failed: {e}");
            }
        }
        self.manager.flush();
    }

    pub fn status(&self) -> ForwarderStatus {
        ForwarderStatus::new(&self.manager.topology(), self.manager.ledger().total())
    }

    /// Messages waiting in every node's error queue.
    pub fn queue_depth(&self) -> usize {
        self.manager
            .topology()
            .nodes()
            .map(|n| n.error_queue().in_message_count())
            .sum()
    }
}

fn collect(messages: &[RelayMessage], indexes: &[usize]) -> Vec<RelayMessage> {
    indexes.iter().map(|&i| messages[i].clone()).collect()
}

fn restore(messages: &mut [RelayMessage], indexes: &[usize], batch: Vec<RelayMessage>) {
    for (&index, message) in indexes.iter().zip(batch) {
        messages[index] = message;
    }
}
