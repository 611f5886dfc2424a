//! One downstream cache node.
//!
//! A node owns the transport that reaches it, its circuit breaker, its
//! error queue and a batch buffer of pending one-way sends. Live traffic
//! is kept away from a node that is deactivated or in the danger zone:
//! one-way messages go straight to the error queue, two-way messages fail
//! without touching the transport.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use relay_core::{
    BatchedQueue, DropNotifier, ErrorType, Outcome, RelayMessage, SerializedMessage,
    TransportFault,
};
use relay_persistence::ErrorQueue;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ForwardingConfig, GroupDefinition, NodeDefinition};
use crate::health::{HealthSnapshot, NodeHealth};
use crate::transport::Transport;

/// Placement of a node inside the topology, recomputed on every load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub zone: u16,
    /// The node is this forwarder itself.
    pub is_local: bool,
    /// The node's cluster contains this forwarder.
    pub me_in_cluster: bool,
}

/// Collaborators a node is built with.
#[derive(Clone)]
pub struct NodeContext {
    pub transport: Arc<dyn Transport>,
    pub error_queue: Arc<ErrorQueue>,
    pub handle: Handle,
    pub dropped: DropNotifier,
}

pub struct Node {
    name: String,
    host: String,
    port: u16,
    ip: Option<IpAddr>,
    group: String,
    placement: RwLock<Placement>,
    activated: AtomicBool,
    repost_message_lists: AtomicBool,
    health: Mutex<NodeHealth>,
    transport: Arc<dyn Transport>,
    error_queue: Arc<ErrorQueue>,
    batch: BatchedQueue<SerializedMessage>,
    handle: Handle,
    dropped: DropNotifier,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        definition: &NodeDefinition,
        ip: Option<IpAddr>,
        group: &GroupDefinition,
        placement: Placement,
        forwarding: &ForwardingConfig,
        ctx: NodeContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Node>| {
            let weak = weak.clone();
            let batch = BatchedQueue::new(
                forwarding.message_burst_length,
                forwarding.message_burst_timeout(),
                ctx.handle.clone(),
                move |messages: Vec<SerializedMessage>| {
                    let weak = weak.clone();
                    async move {
                        if let Some(node) = weak.upgrade() {
                            node.process_batch(messages).await;
                        }
                    }
                },
            );
            Node {
                name: definition.name(),
                host: definition.host.clone(),
                port: definition.port,
                ip,
                group: group.name.clone(),
                placement: RwLock::new(placement),
                activated: AtomicBool::new(definition.activated),
                repost_message_lists: AtomicBool::new(forwarding.repost_message_lists),
                health: Mutex::new(NodeHealth::new(
                    &forwarding.health,
                    group.danger_zone_threshold,
                    group.danger_zone_window(),
                )),
                transport: ctx.transport,
                error_queue: ctx.error_queue,
                batch,
                handle: ctx.handle,
                dropped: ctx.dropped,
            }
        })
    }

    /// Applies a reloaded definition to a node that survived the reload.
    pub fn reload(
        &self,
        definition: &NodeDefinition,
        group: &GroupDefinition,
        placement: Placement,
        forwarding: &ForwardingConfig,
    ) {
        self.activated.store(definition.activated, Ordering::Release);
        self.repost_message_lists
            .store(forwarding.repost_message_lists, Ordering::Release);
        *self.placement.write().unwrap_or_else(|e| e.into_inner()) = placement;
        self.health()
            .set_danger_zone(group.danger_zone_threshold, group.danger_zone_window());
        self.batch.set_batch_size(forwarding.message_burst_length);
        self.batch.set_batch_timeout(forwarding.message_burst_timeout());
        self.error_queue.reload_config(&forwarding.queue);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn placement(&self) -> Placement {
        *self.placement.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn zone(&self) -> u16 {
        self.placement().zone
    }

    pub fn is_local(&self) -> bool {
        self.placement().is_local
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn is_danger_zone(&self) -> bool {
        self.health().is_danger_zone()
    }

    pub fn is_unreachable(&self) -> bool {
        self.health().is_unreachable()
    }

    /// Activated and not in the danger zone.
    pub fn is_available(&self) -> bool {
        self.is_activated() && !self.is_danger_zone()
    }

    pub fn error_queue(&self) -> &Arc<ErrorQueue> {
        &self.error_queue
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health().snapshot()
    }

    pub fn batch_size(&self) -> usize {
        self.batch.batch_size()
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch.batch_timeout()
    }

    /// Advances the circuit-breaker windows.
    pub fn tick(&self) {
        self.health().tick();
    }

    /// Hands any buffered one-way messages to the transport now.
    pub fn flush(&self) {
        self.batch.flush();
    }

    fn health(&self) -> MutexGuard<'_, NodeHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_fault(&self, fault: &TransportFault) {
        debug!(node = %self.name, "send failed: {fault}");
        self.health().record_fault(fault.kind);
    }

    /// Buffers a one-way message for the next burst.
    pub fn handle_in_message(&self, message: SerializedMessage) {
        self.batch.enqueue(message);
    }

    /// Handles one one-way message, either sending it now (`sync_in`) or
    /// buffering it. Returns false only for a synchronous failure that the
    /// caller asked to hear about.
    pub async fn handle_in_message_sync(
        &self,
        message: &mut RelayMessage,
        sync_in: bool,
        skip_error_queue: bool,
    ) -> bool {
        if sync_in {
            return self.send_message(message, true, skip_error_queue).await;
        }
        message.outcome = Some(Outcome::Queued);
        match SerializedMessage::encode(message) {
            Ok(serialized) => self.batch.enqueue(serialized),
            Err(e) => {
                warn!(node = %self.name, id = message.id, "message could not be encoded: {e}");
                self.dropped.notify_message(message);
            }
        }
        true
    }

    /// Handles a list of one-way messages bound for this node. Returns
    /// false when a synchronous send failed and was not queued.
    pub async fn handle_in_messages(
        self: &Arc<Self>,
        messages: Vec<SerializedMessage>,
        sync_in: bool,
        skip_error_queue: bool,
    ) -> bool {
        if sync_in {
            return self.send_in_messages(messages, skip_error_queue).await;
        }
        if messages.is_empty() {
            return true;
        }
        if self.repost_message_lists.load(Ordering::Acquire) {
            for message in messages {
                self.batch.enqueue(message);
            }
        } else {
            let node = Arc::clone(self);
            self.handle.spawn(async move {
                node.send_in_messages(messages, false).await;
            });
        }
        true
    }

    async fn process_batch(&self, mut messages: Vec<SerializedMessage>) {
        if messages.len() == 1 {
            if let Some(message) = messages.pop() {
                self.send_in_message(message).await;
            }
        } else {
            self.send_in_messages(messages, false).await;
        }
    }

    /// Sends one one-way message, queueing it on any failure.
    pub async fn send_in_message(&self, message: SerializedMessage) {
        if !self.is_activated() {
            self.dropped.notify(message);
            return;
        }
        if self.is_danger_zone() {
            self.error_queue.enqueue(message);
            return;
        }
        match self.transport.send_in(&message).await {
            Ok(()) => {}
            Err(fault) => {
                self.error_queue.enqueue(message);
                self.record_fault(&fault);
            }
        }
    }

    /// Sends a list of one-way messages in one round trip. On failure the
    /// list is queued unless `skip_error_queue`, in which case false is
    /// returned.
    pub async fn send_in_messages(
        &self,
        messages: Vec<SerializedMessage>,
        skip_error_queue: bool,
    ) -> bool {
        if !self.is_activated() {
            if !skip_error_queue {
                for message in messages {
                    self.dropped.notify(message);
                }
            }
            return false;
        }
        if self.is_danger_zone() {
            if skip_error_queue {
                return false;
            }
            self.error_queue.enqueue_all(messages);
            return true;
        }
        match self.transport.send_in_list(&messages).await {
            Ok(()) => true,
            Err(fault) => {
                self.record_fault(&fault);
                if skip_error_queue {
                    false
                } else {
                    self.error_queue.enqueue_all(messages);
                    true
                }
            }
        }
    }

    /// Sends a live message and waits for the reply.
    ///
    /// With `sync_in` set this is a synchronous one-way send: a failure is
    /// queued, or with `skip_error_queue` reported by returning false.
    /// For two-way messages the result lives on the message and the
    /// return value is false only if the send produced an error.
    pub async fn send_message(
        &self,
        message: &mut RelayMessage,
        sync_in: bool,
        skip_error_queue: bool,
    ) -> bool {
        let report_failure = sync_in && skip_error_queue;
        let handled = if !self.is_activated() {
            !report_failure
        } else if self.is_danger_zone() {
            message.set_error(ErrorType::NodeInDangerZone);
            if sync_in && !skip_error_queue {
                self.queue_failed_sync(message);
            }
            !report_failure
        } else {
            match self.transport.send_message(message).await {
                Ok(()) => !message.error_occurred(),
                Err(fault) => {
                    message.set_fault(&fault);
                    self.record_fault(&fault);
                    if sync_in && !skip_error_queue {
                        self.queue_failed_sync(message);
                    }
                    !report_failure
                }
            }
        };
        if message.outcome.is_none() {
            message.outcome = Some(Outcome::NotSent);
        }
        handled
    }

    fn queue_failed_sync(&self, message: &RelayMessage) {
        if message.is_two_way() {
            return;
        }
        match SerializedMessage::encode(message) {
            Ok(serialized) => self.error_queue.enqueue(serialized),
            Err(e) => warn!(node = %self.name, id = message.id, "message could not be encoded: {e}"),
        }
    }

    /// Sends a list of two-way messages. Returns false if the list never
    /// reached the node; each message then carries the reason.
    pub async fn send_out_messages(&self, messages: &mut [RelayMessage]) -> bool {
        if !self.is_activated() {
            for message in messages.iter_mut() {
                message.outcome.get_or_insert(Outcome::NotSent);
            }
            return false;
        }
        if self.is_danger_zone() {
            for message in messages.iter_mut() {
                message.set_error(ErrorType::NodeInDangerZone);
            }
            return false;
        }
        match self.transport.send_out_list(messages).await {
            Ok(()) => true,
            Err(fault) => {
                for message in messages.iter_mut() {
                    message.set_fault(&fault);
                }
                self.record_fault(&fault);
                false
            }
        }
    }

    /// Resends one dequeued slice of the error queue, unless the node is
    /// still in the danger zone.
    pub async fn process_queue(&self) {
        if self.is_danger_zone() {
            return;
        }
        if let Some(messages) = self.error_queue.dequeue() {
            info!(
                node = %self.name,
                count = messages.len(),
                "resending messages from error queue"
            );
            self.send_in_messages(messages, false).await;
        }
    }
}
