//! Per-node circuit breaker.
//!
//! Two error streams are tracked in rolling windows advanced by
//! [`NodeHealth::tick`]:
//!
//! - unreachable errors put the node out of service for a wait period that
//!   grows while errors keep coming and falls back to its base once the
//!   window goes quiet;
//! - server-down errors open the danger zone when the trailing window
//!   holds more than the group's threshold and the last one is recent.
//!
//! An unreachable node is always in the danger zone.

use std::time::Duration;

use relay_core::FaultKind;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::HealthConfig;

/// Error counts in a ring of tick-sized buckets.
#[derive(Debug, Clone)]
struct AggregateCounter {
    buckets: Vec<u32>,
    index: usize,
    total: u32,
}

impl AggregateCounter {
    fn new(len: usize) -> Self {
        Self {
            buckets: vec![0; len.max(1)],
            index: 0,
            total: 0,
        }
    }

    fn increment(&mut self) {
        self.buckets[self.index] = self.buckets[self.index].saturating_add(1);
        self.total = self.total.saturating_add(1);
    }

    /// Returns the count over the whole window, then starts a new bucket.
    fn tick(&mut self) -> u32 {
        let total = self.total;
        self.index = (self.index + 1) % self.buckets.len();
        self.total -= self.buckets[self.index];
        self.buckets[self.index] = 0;
        total
    }
}

/// Circuit-breaker state of one node.
#[derive(Debug)]
pub struct NodeHealth {
    config: HealthConfig,
    danger_zone_threshold: u32,
    danger_zone_window: Duration,

    wait: Duration,
    unreachable_counter: AggregateCounter,
    unreachable_last_two_windows: u32,
    unreachable_errors: u64,
    last_unreachable: Option<Instant>,

    server_down_counter: AggregateCounter,
    server_down_last_window: u32,
    server_down_errors: u64,
    last_server_down: Option<Instant>,
}

/// A point-in-time view of a node's health, for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub wait_seconds: f64,
    pub unreachable_errors: u64,
    pub server_down_errors: u64,
    pub server_down_last_window: u32,
}

impl NodeHealth {
    pub fn new(config: &HealthConfig, danger_zone_threshold: u32, danger_zone_window: Duration) -> Self {
        let wait = config.base_wait();
        Self {
            unreachable_counter: AggregateCounter::new(config.ticks_for(wait * 2)),
            server_down_counter: AggregateCounter::new(
                config.ticks_for(Duration::from_secs(config.server_down_window_secs)),
            ),
            config: config.clone(),
            danger_zone_threshold,
            danger_zone_window,
            wait,
            unreachable_last_two_windows: 0,
            unreachable_errors: 0,
            last_unreachable: None,
            server_down_last_window: 0,
            server_down_errors: 0,
            last_server_down: None,
        }
    }

    /// Applies new group thresholds. Counters are kept.
    pub fn set_danger_zone(&mut self, threshold: u32, window: Duration) {
        self.danger_zone_threshold = threshold;
        self.danger_zone_window = window;
    }

    /// Counts a transport fault against the matching window.
    pub fn record_fault(&mut self, kind: FaultKind) {
        if kind.is_unreachable() {
            self.record_unreachable();
        } else if kind.is_server_down() {
            self.record_server_down();
        }
    }

    pub fn record_unreachable(&mut self) {
        let trigger = self.config.unreachable_growth_trigger;
        if self.unreachable_last_two_windows >= trigger && self.wait < self.config.max_wait() {
            let grown = self.wait.mul_f64(self.config.unreachable_growth_factor.max(1.0));
            self.set_wait(grown.min(self.config.max_wait()));
        } else if self.unreachable_last_two_windows == 0 {
            self.reset_wait();
        }
        self.unreachable_errors += 1;
        self.unreachable_counter.increment();
        self.last_unreachable = Some(Instant::now());
    }

    pub fn record_server_down(&mut self) {
        self.server_down_errors += 1;
        self.server_down_counter.increment();
        self.last_server_down = Some(Instant::now());
    }

    /// Advances both windows by one period.
    pub fn tick(&mut self) {
        self.server_down_last_window = self.server_down_counter.tick();
        self.unreachable_last_two_windows = self.unreachable_counter.tick();
        if self.unreachable_last_two_windows == 0 {
            self.reset_wait();
        }
    }

    pub fn is_unreachable(&self) -> bool {
        match self.last_unreachable {
            Some(last) => self.unreachable_errors > 0 && last + self.wait > Instant::now(),
            None => false,
        }
    }

    pub fn is_danger_zone(&self) -> bool {
        if self.is_unreachable() {
            return true;
        }
        match self.last_server_down {
            Some(last) => {
                self.server_down_last_window > self.danger_zone_threshold
                    && last + self.danger_zone_window > Instant::now()
            }
            None => false,
        }
    }

    /// Current unreachable wait period.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn wait_seconds(&self) -> f64 {
        self.wait.as_secs_f64()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            wait_seconds: self.wait_seconds(),
            unreachable_errors: self.unreachable_errors,
            server_down_errors: self.server_down_errors,
            server_down_last_window: self.server_down_last_window,
        }
    }

    fn reset_wait(&mut self) {
        let base = self.config.base_wait();
        if self.wait != base {
            self.set_wait(base);
        }
    }

    /// The unreachable window always spans two wait periods, so a new
    /// wait starts a fresh, resized window.
    fn set_wait(&mut self, wait: Duration) {
        self.wait = wait;
        self.unreachable_counter = AggregateCounter::new(self.config.ticks_for(wait * 2));
    }
}
