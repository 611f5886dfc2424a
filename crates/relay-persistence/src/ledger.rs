//! Process-wide accounting of persisted error-queue bytes.
//!
//! One ledger is shared by every node's spill engine. Per-node totals
//! live behind a small mutex so a node's contribution can be reset when
//! its folder is rescanned; the aggregate is an atomic so the ceiling
//! check never waits on another node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Aggregate persisted bytes across all nodes, with an optional ceiling.
#[derive(Debug)]
pub struct SpillLedger {
    by_node: Mutex<HashMap<String, i64>>,
    total: AtomicI64,
    max_bytes: AtomicI64,
}

impl Default for SpillLedger {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SpillLedger {
    /// Creates a ledger. A `max_bytes` of zero means unlimited.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            by_node: Mutex::new(HashMap::new()),
            total: AtomicI64::new(0),
            max_bytes: AtomicI64::new(ceiling(max_bytes)),
        }
    }

    /// Creates a ledger whose ceiling is given in megabytes.
    pub fn from_mb(max_mb: u64) -> Self {
        Self::new(max_mb.saturating_mul(1024 * 1024))
    }

    /// Adds `delta` bytes (negative to release) for `node`. Returns true if
    /// the aggregate now exceeds the ceiling.
    pub fn increment(&self, node: &str, delta: i64) -> bool {
        {
            let mut by_node = self.by_node.lock().unwrap_or_else(|e| e.into_inner());
            *by_node.entry(node.to_owned()).or_insert(0) += delta;
        }
        let total = self.total.fetch_add(delta, Ordering::AcqRel) + delta;
        metrics::gauge!("relay_persisted_error_queue_bytes").set(total as f64);
        total > self.max_bytes.load(Ordering::Acquire)
    }

    /// Forgets everything recorded for `node`.
    pub fn reset_node(&self, node: &str) {
        let removed = {
            let mut by_node = self.by_node.lock().unwrap_or_else(|e| e.into_inner());
            by_node.remove(node)
        };
        if let Some(bytes) = removed {
            let total = self.total.fetch_sub(bytes, Ordering::AcqRel) - bytes;
            metrics::gauge!("relay_persisted_error_queue_bytes").set(total as f64);
        }
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    /// Bytes currently recorded for one node.
    pub fn node_total(&self, node: &str) -> i64 {
        let by_node = self.by_node.lock().unwrap_or_else(|e| e.into_inner());
        by_node.get(node).copied().unwrap_or(0)
    }

    /// The ceiling, or `i64::MAX` when unlimited.
    pub fn max_bytes(&self) -> i64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.max_bytes.store(ceiling(max_bytes), Ordering::Release);
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_bytes() == i64::MAX
    }
}

fn ceiling(max_bytes: u64) -> i64 {
    if max_bytes == 0 {
        i64::MAX
    } else {
        i64::try_from(max_bytes).unwrap_or(i64::MAX)
    }
}
