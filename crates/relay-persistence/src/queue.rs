//! Per-node backlog of undeliverable one-way messages.
//!
//! Messages land in an in-memory FIFO. Without persistence the FIFO is
//! capped at `max_count` and the oldest entries are discarded. With a
//! persistence folder configured, every enqueue kicks the node's spill
//! engine, which drains the FIFO to disk; the queue is then bounded only
//! by the shared [`SpillLedger`] ceiling.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use relay_core::{DropNotifier, SerializedMessage};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ledger::SpillLedger;
use crate::spill::{SpillConfig, SpillEngine, SpillSource};

/// Error-queue tunables, shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    /// In-memory cap when persistence is off.
    pub max_count: usize,
    /// Upper bound on one dequeue, and the number of messages per spill
    /// file.
    pub items_per_dequeue: usize,
    /// Root folder for spill files. Unset disables persistence.
    pub persistence_folder: Option<PathBuf>,
    pub persistence_file_size: u64,
    /// Ceiling on persisted bytes across all nodes. 0 is unlimited.
    pub max_persisted_mb: u64,
    /// How often each node drains its queue back to the transport.
    pub dequeue_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_count: 1000,
            items_per_dequeue: 100,
            persistence_folder: None,
            persistence_file_size: 10 * 1024 * 1024,
            max_persisted_mb: 0,
            dequeue_interval_secs: 10,
        }
    }
}

impl QueueConfig {
    pub fn dequeue_interval(&self) -> Duration {
        Duration::from_secs(self.dequeue_interval_secs.max(1))
    }

    /// The spill settings, if persistence is configured.
    pub fn spill_config(&self) -> Option<SpillConfig> {
        let root = self.persistence_folder.as_ref()?;
        if root.as_os_str().is_empty() {
            return None;
        }
        Some(SpillConfig {
            root: root.clone(),
            items_per_file: self.items_per_dequeue,
            max_file_size: self.persistence_file_size,
        })
    }
}

/// The serializable form of a queue, used to carry a backlog across a
/// controlled restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub enabled: bool,
    pub max_count: usize,
    pub items_per_dequeue: usize,
    pub messages: Option<Vec<SerializedMessage>>,
}

#[derive(Default)]
struct MemoryQueue {
    items: Mutex<VecDeque<SerializedMessage>>,
}

impl MemoryQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<SerializedMessage>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpillSource for MemoryQueue {
    fn drain(&self) -> Vec<SerializedMessage> {
        self.lock().drain(..).collect()
    }

    fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }
}

/// A node's error queue.
pub struct ErrorQueue {
    node_name: String,
    enabled: AtomicBool,
    max_count: AtomicUsize,
    items_per_dequeue: AtomicUsize,
    discard_count: AtomicU64,
    memory: Arc<MemoryQueue>,
    persistence: RwLock<Option<SpillEngine>>,
    spill_config: Mutex<Option<SpillConfig>>,
    ledger: Arc<SpillLedger>,
    dropped: DropNotifier,
}

impl ErrorQueue {
    /// Creates the queue for `node_name` (conventionally `host-port`).
    pub fn new(
        config: &QueueConfig,
        node_name: &str,
        ledger: Arc<SpillLedger>,
        dropped: DropNotifier,
    ) -> Self {
        let queue = Self::detached(node_name, ledger, dropped);
        queue.reload_config(config);
        queue
    }

    fn detached(node_name: &str, ledger: Arc<SpillLedger>, dropped: DropNotifier) -> Self {
        Self {
            node_name: node_name.to_owned(),
            enabled: AtomicBool::new(false),
            max_count: AtomicUsize::new(QueueConfig::default().max_count),
            items_per_dequeue: AtomicUsize::new(QueueConfig::default().items_per_dequeue),
            discard_count: AtomicU64::new(0),
            memory: Arc::new(MemoryQueue::default()),
            persistence: RwLock::new(None),
            spill_config: Mutex::new(None),
            ledger,
            dropped,
        }
    }

    /// Rebuilds a queue from a saved state. The result has no persistence
    /// and is meant to be [`populate`](Self::populate)d into a live queue.
    pub fn from_state(
        state: QueueState,
        node_name: &str,
        ledger: Arc<SpillLedger>,
        dropped: DropNotifier,
    ) -> Self {
        let queue = Self::detached(node_name, ledger, dropped);
        queue.enabled.store(state.enabled, Ordering::Release);
        queue.max_count.store(state.max_count, Ordering::Release);
        queue
            .items_per_dequeue
            .store(state.items_per_dequeue.max(1), Ordering::Release);
        if let Some(messages) = state.messages {
            queue.memory.lock().extend(messages);
        }
        queue
    }

    /// Applies new settings. Persistence is reopened only if its settings
    /// changed.
    pub fn reload_config(&self, config: &QueueConfig) {
        self.max_count.store(config.max_count, Ordering::Release);
        self.items_per_dequeue
            .store(config.items_per_dequeue.max(1), Ordering::Release);

        let wanted = config.spill_config();
        let mut current = self.spill_config.lock().unwrap_or_else(|e| e.into_inner());
        let changed = match (&*current, &wanted) {
            (Some(a), Some(b)) => {
                a.root != b.root
                    || a.items_per_file != b.items_per_file
                    || a.max_file_size != b.max_file_size
            }
            (None, None) => false,
            _ => true,
        };
        if changed {
            let engine = wanted.clone().and_then(|spill| self.open_engine(spill));
            *self.persistence.write().unwrap_or_else(|e| e.into_inner()) = engine;
            *current = wanted;
        }
        drop(current);

        self.enabled.store(config.enabled, Ordering::Release);
        info!(
            node = %self.node_name,
            enabled = config.enabled,
            max_count = config.max_count,
            items_per_dequeue = config.items_per_dequeue,
            persistent = self.engine().is_some(),
            "error queue configured"
        );
        self.start_spill();
    }

    fn open_engine(&self, spill: SpillConfig) -> Option<SpillEngine> {
        let source: Arc<dyn SpillSource> = self.memory.clone();
        let engine = match SpillEngine::open(
            spill,
            &self.node_name,
            source,
            Arc::clone(&self.ledger),
            self.dropped.clone(),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                error!(node = %self.node_name, "failed to initialize persistent error queue: {e}");
                return None;
            }
        };
        if let Err(e) = engine.create_spill_folder() {
            error!(node = %self.node_name, folder = %engine.folder().display(), "failed to create spill folder: {e}");
            return None;
        }
        Some(engine)
    }

    fn engine(&self) -> Option<SpillEngine> {
        self.persistence
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queues one message. Two-way messages are ignored. A disabled queue
    /// reports the message as dropped.
    pub fn enqueue(&self, message: SerializedMessage) {
        if message.is_two_way() {
            return;
        }
        if !self.is_enabled() {
            self.dropped.notify(message);
            return;
        }

        let persistent = self.engine().is_some();
        let discard = {
            let mut items = self.memory.lock();
            items.push_back(message);
            if !persistent && items.len() > self.max_count() {
                items.pop_front()
            } else {
                None
            }
        };
        metrics::gauge!("relay_error_queue_depth").increment(1.0);

        if let Some(discard) = discard {
            self.discard(vec![discard]);
        }
        self.start_spill();
    }

    /// Queues a list of messages, skipping two-way ones.
    pub fn enqueue_all(&self, messages: Vec<SerializedMessage>) {
        if messages.is_empty() {
            return;
        }
        if !self.is_enabled() {
            for message in messages.into_iter().filter(|m| !m.is_two_way()) {
                self.dropped.notify(message);
            }
            return;
        }

        let persistent = self.engine().is_some();
        let max_count = self.max_count();
        let mut count = 0usize;
        let discards = {
            let mut items = self.memory.lock();
            for message in messages.into_iter().filter(|m| !m.is_two_way()) {
                items.push_back(message);
                count += 1;
            }
            if !persistent && items.len() > max_count {
                let excess = items.len() - max_count;
                items.drain(..excess).collect()
            } else {
                Vec::new()
            }
        };
        metrics::gauge!("relay_error_queue_depth").increment(count as f64);

        if !discards.is_empty() {
            self.discard(discards);
        }
        if count > 0 {
            self.start_spill();
        }
    }

    fn discard(&self, messages: Vec<SerializedMessage>) {
        let count = messages.len();
        warn!(node = %self.node_name, count, "error queue full, discarding oldest messages");
        for message in messages {
            self.dropped.notify(message);
        }
        metrics::gauge!("relay_error_queue_depth").decrement(count as f64);
        metrics::counter!("relay_error_queue_discards_total").increment(count as u64);
        self.discard_count.fetch_add(count as u64, Ordering::AcqRel);
    }

    /// Takes up to `items_per_dequeue` messages, oldest first. Persisted
    /// messages come out before anything still in memory.
    pub fn dequeue(&self) -> Option<Vec<SerializedMessage>> {
        if !self.is_enabled() || self.in_message_count() == 0 {
            return None;
        }

        let mut list = Vec::new();
        match self.engine() {
            Some(engine) if engine.file_count() > 0 || engine.is_spilling() => {
                // a bad file has already been renamed and logged
                let _ = engine.dequeue(&mut list);
            }
            _ => {
                let limit = self.items_per_dequeue();
                let mut items = self.memory.lock();
                let take = items.len().min(limit);
                list.extend(items.drain(..take));
            }
        }

        if list.is_empty() {
            return None;
        }
        metrics::gauge!("relay_error_queue_depth").decrement(list.len() as f64);
        Some(list)
    }

    /// Moves `old`'s in-memory backlog in front of this queue's own.
    ///
    /// Used when a freshly built queue takes over from a previous
    /// incarnation. `increment_counters` re-adds the moved messages to the
    /// depth gauge, for backlogs that were never counted in this process.
    pub fn populate(&self, old: &ErrorQueue, increment_counters: bool) {
        let moved: Vec<SerializedMessage> = old.memory.lock().drain(..).collect();
        if moved.is_empty() {
            return;
        }
        let count = moved.len();
        {
            let mut items = self.memory.lock();
            let current: Vec<SerializedMessage> = items.drain(..).collect();
            items.extend(moved);
            items.extend(current);
        }
        if increment_counters {
            metrics::gauge!("relay_error_queue_depth").increment(count as f64);
        }
        self.start_spill();
    }

    /// Captures the queue for a controlled restart. Persistent queues are
    /// spilled first, so the state only holds what never reached disk.
    pub fn to_state(&self) -> QueueState {
        if let Some(engine) = self.engine() {
            engine.start_spill();
            engine.wait_for_spill();
        }
        let items = self.memory.lock();
        QueueState {
            enabled: self.is_enabled(),
            max_count: self.max_count(),
            items_per_dequeue: self.items_per_dequeue(),
            messages: Some(items.iter().cloned().collect()),
        }
    }

    fn start_spill(&self) {
        if let Some(engine) = self.engine() {
            engine.start_spill();
        }
    }

    /// Blocks until any running spill finishes.
    pub fn wait_for_spill(&self) {
        if let Some(engine) = self.engine() {
            engine.wait_for_spill();
        }
    }

    /// Messages held in memory and on disk.
    pub fn in_message_count(&self) -> usize {
        let persisted = self.engine().map_or(0, |e| e.message_count());
        persisted + self.memory.lock().len()
    }

    /// Messages lost to overflow or discarded spill files.
    pub fn discard_count(&self) -> u64 {
        let persisted = self.engine().map_or(0, |e| e.discard_count());
        self.discard_count.load(Ordering::Acquire) + persisted
    }

    pub fn file_count(&self) -> usize {
        self.engine().map_or(0, |e| e.file_count())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_persistent(&self) -> bool {
        self.engine().is_some()
    }

    pub fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Acquire)
    }

    pub fn items_per_dequeue(&self) -> usize {
        self.items_per_dequeue.load(Ordering::Acquire)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{MessageType, RelayMessage};

    fn one_way(id: i32) -> SerializedMessage {
        let m = RelayMessage::new(MessageType::Save, 5, id).with_payload(vec![1u8; 16]);
        SerializedMessage::encode(&m).unwrap()
    }

    fn two_way(id: i32) -> SerializedMessage {
        SerializedMessage::encode(&RelayMessage::new(MessageType::Get, 5, id)).unwrap()
    }

    fn memory_config(max_count: usize, items_per_dequeue: usize) -> QueueConfig {
        QueueConfig {
            max_count,
            items_per_dequeue,
            ..QueueConfig::default()
        }
    }

    fn persistent_config(root: &std::path::Path, items_per_dequeue: usize) -> QueueConfig {
        QueueConfig {
            items_per_dequeue,
            persistence_folder: Some(root.to_path_buf()),
            ..QueueConfig::default()
        }
    }

    fn ids(messages: &[SerializedMessage]) -> Vec<i32> {
        messages.iter().map(|m| m.id).collect()
    }

    fn queue(config: &QueueConfig, dropped: &DropNotifier) -> ErrorQueue {
        ErrorQueue::new(config, "10.0.0.1-4000", Arc::new(SpillLedger::default()), dropped.clone())
    }

    #[test]
    fn two_way_messages_are_rejected() {
        let q = queue(&memory_config(10, 10), &DropNotifier::new());
        q.enqueue(two_way(1));
        q.enqueue_all(vec![two_way(2), one_way(3)]);
        assert_eq!(q.in_message_count(), 1);
        assert_eq!(ids(&q.dequeue().unwrap()), vec![3]);
    }

    #[test]
    fn memory_queue_caps_and_discards_oldest() {
        let dropped = DropNotifier::new();
        let mut rx = dropped.subscribe();
        let q = queue(&memory_config(3, 10), &dropped);

        for id in 0..5 {
            q.enqueue(one_way(id));
        }
        assert_eq!(q.in_message_count(), 3);
        assert_eq!(q.discard_count(), 2);
        assert_eq!(rx.try_recv().unwrap().id, 0);
        assert_eq!(rx.try_recv().unwrap().id, 1);

        q.enqueue_all((5..7).map(one_way).collect());
        assert_eq!(q.discard_count(), 4);
        assert_eq!(ids(&q.dequeue().unwrap()), vec![4, 5, 6]);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn dequeue_respects_items_per_dequeue() {
        let q = queue(&memory_config(100, 4), &DropNotifier::new());
        q.enqueue_all((0..10).map(one_way).collect());
        assert_eq!(ids(&q.dequeue().unwrap()), vec![0, 1, 2, 3]);
        assert_eq!(ids(&q.dequeue().unwrap()), vec![4, 5, 6, 7]);
        assert_eq!(ids(&q.dequeue().unwrap()), vec![8, 9]);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn disabled_queue_drops_everything() {
        let dropped = DropNotifier::new();
        let mut rx = dropped.subscribe();
        let config = QueueConfig {
            enabled: false,
            ..QueueConfig::default()
        };
        let q = queue(&config, &dropped);

        q.enqueue(one_way(1));
        q.enqueue_all(vec![one_way(2), two_way(3)]);
        assert_eq!(q.in_message_count(), 0);
        assert_eq!(rx.try_recv().unwrap().id, 1);
        assert_eq!(rx.try_recv().unwrap().id, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fifo_survives_spill_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = persistent_config(dir.path(), 3);
        let ledger = Arc::new(SpillLedger::default());

        {
            let q = ErrorQueue::new(&config, "node-1", Arc::clone(&ledger), DropNotifier::new());
            assert!(q.is_persistent());
            for id in 0..5 {
                q.enqueue(one_way(id));
            }
            q.enqueue_all((5..8).map(one_way).collect());
            q.wait_for_spill();
            assert_eq!(q.in_message_count(), 8);
            assert_eq!(q.file_count(), 3);
        }

        // a new incarnation picks the files back up
        let q = ErrorQueue::new(&config, "node-1", Arc::new(SpillLedger::default()), DropNotifier::new());
        q.wait_for_spill();
        assert_eq!(q.in_message_count(), 8);
        q.enqueue(one_way(8));
        q.wait_for_spill();

        let mut out = Vec::new();
        while let Some(batch) = q.dequeue() {
            assert!(batch.len() <= 3);
            out.extend(batch);
        }
        assert_eq!(ids(&out), (0..9).collect::<Vec<_>>());
        assert_eq!(q.in_message_count(), 0);
    }

    #[test]
    fn populate_puts_old_backlog_first() {
        let old = queue(&memory_config(100, 100), &DropNotifier::new());
        old.enqueue_all((0..3).map(one_way).collect());

        let fresh = queue(&memory_config(100, 100), &DropNotifier::new());
        fresh.enqueue(one_way(10));
        fresh.populate(&old, false);

        assert_eq!(old.in_message_count(), 0);
        assert_eq!(ids(&fresh.dequeue().unwrap()), vec![0, 1, 2, 10]);
    }

    #[test]
    fn state_restores_into_a_fresh_queue() {
        let q = queue(&memory_config(50, 20), &DropNotifier::new());
        q.enqueue_all((0..4).map(one_way).collect());

        let state = q.to_state();
        assert!(state.enabled);
        assert_eq!(state.max_count, 50);
        assert_eq!(state.messages.as_ref().map(Vec::len), Some(4));

        let bytes = bincode::serialize(&state).unwrap();
        let state: QueueState = bincode::deserialize(&bytes).unwrap();
        let restored = ErrorQueue::from_state(
            state,
            "10.0.0.1-4000",
            Arc::new(SpillLedger::default()),
            DropNotifier::new(),
        );
        let live = queue(&memory_config(50, 20), &DropNotifier::new());
        live.populate(&restored, true);
        assert_eq!(ids(&live.dequeue().unwrap()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reload_toggles_enabled_and_cap() {
        let dropped = DropNotifier::new();
        let q = queue(&memory_config(10, 10), &dropped);
        q.reload_config(&memory_config(2, 10));
        q.enqueue_all((0..4).map(one_way).collect());
        assert_eq!(q.in_message_count(), 2);

        q.reload_config(&QueueConfig {
            enabled: false,
            ..memory_config(2, 10)
        });
        assert!(q.dequeue().is_none());
    }
}
