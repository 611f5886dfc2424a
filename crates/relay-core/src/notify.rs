//! The single "message dropped" channel.
//!
//! Every way a message can be lost (no route, queue overflow, a discarded
//! spill file, a disabled error queue) reports through one `DropNotifier`
//! so observers see one consistent signal whatever the cause.

use tokio::sync::broadcast;

use crate::message::{Outcome, RelayMessage};
use crate::serialized::SerializedMessage;

const DROP_CHANNEL_CAPACITY: usize = 1024;

/// A cloneable handle for reporting dropped messages.
#[derive(Debug, Clone)]
pub struct DropNotifier {
    tx: broadcast::Sender<SerializedMessage>,
}

impl Default for DropNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DropNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DROP_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes to future drop notifications.
    ///
    /// Slow subscribers lag and miss the oldest notifications rather than
    /// stalling the forwarder.
    pub fn subscribe(&self) -> broadcast::Receiver<SerializedMessage> {
        self.tx.subscribe()
    }

    /// Reports a dropped message.
    pub fn notify(&self, message: SerializedMessage) {
        metrics::counter!("relay_messages_dropped_total").increment(1);
        tracing::trace!(
            type_id = message.type_id,
            id = message.id,
            "message dropped"
        );
        // no subscribers is fine
        let _ = self.tx.send(message);
    }

    /// Reports a dropped live message, marking its outcome.
    pub fn notify_message(&self, message: &mut RelayMessage) {
        message.outcome = Some(Outcome::Dropped);
        match SerializedMessage::encode(message) {
            Ok(serialized) => self.notify(serialized),
            Err(e) => {
                metrics::counter!("relay_messages_dropped_total").increment(1);
                tracing::warn!(type_id = message.type_id, "dropped message could not be encoded: {e}");
            }
        }
    }
}
