//! relay-persistence: error queues and their disk spill.
//!
//! Each downstream node owns an [`ErrorQueue`] holding one-way messages
//! that couldn't be delivered. A queue can spill its backlog to numbered
//! files through a [`SpillEngine`]; a shared [`SpillLedger`] caps the
//! bytes persisted across all nodes.

pub mod format;
mod ledger;
mod queue;
pub mod spill;

pub use format::FormatError;
pub use ledger::SpillLedger;
pub use queue::{ErrorQueue, QueueConfig, QueueState};
pub use spill::{SpillConfig, SpillEngine, SpillError, SpillSource};
