//! The relay message envelope.
//!
//! Every request that enters the forwarder is a [`RelayMessage`]: a logical
//! type id, a primary key, an optional payload, and a [`MessageType`] that
//! decides whether the sender expects a reply. Messages that expect a reply
//! ("two-way", or "out" messages) are retried live against sibling nodes.
//! Fire-and-forget messages ("one-way", or "in" messages) are batched and,
//! when a node can't take them, parked in that node's error queue.

use std::net::IpAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::fault::{FaultKind, TransportFault};

/// Hop budget given to a freshly created message.
pub const DEFAULT_RELAY_TTL: i16 = 2;

/// What a message asks the receiving node to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[default]
    Undefined,
    Get,
    Save,
    Update,
    Delete,
    DeleteAllInType,
    DeleteAll,
    DeleteInAllTypes,
    Notification,
    Increment,
    Query,
    Invoke,
    SaveWithConfirm,
    UpdateWithConfirm,
    DeleteWithConfirm,
    DeleteAllInTypeWithConfirm,
    DeleteAllWithConfirm,
    DeleteInAllTypesWithConfirm,
    NotificationWithConfirm,
    IncrementWithConfirm,
}

impl MessageType {
    /// True if the sender waits for a reply.
    pub fn is_two_way(self) -> bool {
        matches!(
            self,
            MessageType::Get
                | MessageType::Query
                | MessageType::Invoke
                | MessageType::SaveWithConfirm
                | MessageType::UpdateWithConfirm
                | MessageType::DeleteWithConfirm
                | MessageType::DeleteAllInTypeWithConfirm
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteInAllTypesWithConfirm
                | MessageType::NotificationWithConfirm
                | MessageType::IncrementWithConfirm
        )
    }

    /// True if the message goes to every group rather than the group that
    /// owns its type id.
    pub fn is_group_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::DeleteInAllTypes
                | MessageType::DeleteAll
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteInAllTypesWithConfirm
        )
    }

    /// True if the message goes to every cluster in its group.
    pub fn is_cluster_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::DeleteAllInType
                | MessageType::DeleteAll
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteAllInTypeWithConfirm
        )
    }

    /// True if a reply may carry a payload back to the caller.
    pub fn allows_return_payload(self) -> bool {
        matches!(
            self,
            MessageType::Get | MessageType::Query | MessageType::Invoke
        )
    }

    /// The fire-and-forget counterpart of a confirmed write.
    ///
    /// One-way types map to themselves. Reads have no one-way form.
    pub fn one_way_variant(self) -> Option<MessageType> {
        if !self.is_two_way() {
            return Some(self);
        }
        match self {
            MessageType::SaveWithConfirm => Some(MessageType::Save),
            MessageType::UpdateWithConfirm => Some(MessageType::Update),
            MessageType::DeleteWithConfirm => Some(MessageType::Delete),
            MessageType::DeleteAllInTypeWithConfirm => Some(MessageType::DeleteAllInType),
            MessageType::NotificationWithConfirm => Some(MessageType::Notification),
            MessageType::IncrementWithConfirm => Some(MessageType::Increment),
            MessageType::DeleteAllWithConfirm => Some(MessageType::DeleteAll),
            MessageType::DeleteInAllTypesWithConfirm => Some(MessageType::DeleteInAllTypes),
            _ => None,
        }
    }
}

/// The result of the most recent delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    NotSent,
    Queued,
    Sent,
    Error,
    Timeout,
    Dropped,
}

/// Error code carried on a message after a failed attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    #[default]
    None,
    /// Routing produced no target node.
    NoNodesAvailable,
    /// The target node's circuit breaker is open.
    NodeInDangerZone,
    /// The target node could not be reached.
    NodeUnreachable,
    /// The target node did not answer in time.
    TimedOut,
    /// Any other failure.
    Unknown,
    /// A synchronous one-way send failed and was not queued.
    SyncOperationFailure,
}

/// Which failures a group is willing to retry against a sibling node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    UnreachableNodesOnly,
    UnreachableNodesOrTimeout,
}

/// A typed request travelling through the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub type_id: i16,
    pub id: i32,
    pub extended_id: Option<Bytes>,
    pub message_type: MessageType,
    pub payload: Option<Bytes>,
    /// Remaining hop budget. Decremented once per dispatch.
    pub relay_ttl: i16,
    pub source_zone: u16,
    /// Addresses of every relay that has dispatched this message.
    pub address_history: Vec<IpAddr>,
    pub outcome: Option<Outcome>,
    pub error: ErrorType,
    pub result_detail: Option<String>,
}

impl Default for RelayMessage {
    fn default() -> Self {
        Self {
            type_id: 0,
            id: 0,
            extended_id: None,
            message_type: MessageType::Undefined,
            payload: None,
            relay_ttl: DEFAULT_RELAY_TTL,
            source_zone: 0,
            address_history: Vec::new(),
            outcome: None,
            error: ErrorType::None,
            result_detail: None,
        }
    }
}

impl RelayMessage {
    /// Creates a message with the default hop budget and no payload.
    pub fn new(message_type: MessageType, type_id: i16, id: i32) -> Self {
        Self {
            type_id,
            id,
            message_type,
            ..Self::default()
        }
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is_two_way(&self) -> bool {
        self.message_type.is_two_way()
    }

    pub fn is_group_broadcast(&self) -> bool {
        self.message_type.is_group_broadcast()
    }

    pub fn is_cluster_broadcast(&self) -> bool {
        self.message_type.is_cluster_broadcast()
    }

    pub fn error_occurred(&self) -> bool {
        self.error != ErrorType::None
    }

    /// Records an error code. Any code other than `None` also marks the
    /// outcome as `Error`.
    pub fn set_error(&mut self, error: ErrorType) {
        self.error = error;
        if error != ErrorType::None {
            self.outcome = Some(Outcome::Error);
        }
    }

    /// Records a transport fault as an error code.
    pub fn set_fault(&mut self, fault: &TransportFault) {
        match fault.kind {
            FaultKind::HostUnreachable | FaultKind::ConnectionLost => {
                self.set_error(ErrorType::NodeUnreachable);
                self.result_detail = Some(format!("client: {fault}"));
            }
            FaultKind::TimedOut => {
                self.set_error(ErrorType::TimedOut);
                self.outcome = Some(Outcome::Timeout);
                self.result_detail = Some(format!("client: {fault}"));
            }
            FaultKind::ServerDown | FaultKind::Other => self.set_error(ErrorType::Unknown),
        }
    }

    /// Whether the last failure may be retried on a sibling under `policy`.
    pub fn is_retryable(&self, policy: RetryPolicy) -> bool {
        match policy {
            RetryPolicy::UnreachableNodesOnly => self.error == ErrorType::NodeUnreachable,
            RetryPolicy::UnreachableNodesOrTimeout => {
                self.outcome == Some(Outcome::Timeout)
                    || matches!(
                        self.error,
                        ErrorType::TimedOut
                            | ErrorType::NodeUnreachable
                            | ErrorType::NodeInDangerZone
                    )
            }
        }
    }

    /// Clears error state so the message can be attempted again.
    pub fn reset_for_retry(&mut self) {
        self.relay_ttl = self.relay_ttl.saturating_add(1);
        self.set_error(ErrorType::None);
        self.outcome = Some(Outcome::NotSent);
    }

    pub fn add_address_to_history(&mut self, addr: IpAddr) {
        self.address_history.push(addr);
    }

    /// Copy of this message for delivery across a zone boundary.
    ///
    /// The copy gets one extra hop so the receiving zone can dispatch it
    /// again. Payload, source zone and history are carried over; outcome and
    /// error state start fresh.
    pub fn inter_zone_copy(&self) -> RelayMessage {
        RelayMessage {
            type_id: self.type_id,
            id: self.id,
            extended_id: self.extended_id.clone(),
            message_type: self.message_type,
            payload: self.payload.clone(),
            relay_ttl: self.relay_ttl.saturating_add(1),
            source_zone: self.source_zone,
            address_history: self.address_history.clone(),
            outcome: None,
            error: ErrorType::None,
            result_detail: None,
        }
    }

    /// The one-way form of this message for replication, or `None` for
    /// reads that can't be replicated.
    pub fn replicate(&self) -> Option<RelayMessage> {
        if !self.is_two_way() {
            return Some(self.clone());
        }
        let message_type = self.message_type.one_way_variant()?;
        let mut copy = self.inter_zone_copy();
        copy.message_type = message_type;
        copy.relay_ttl = self.relay_ttl.saturating_sub(1);
        Some(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sets() {
        assert!(MessageType::Get.is_two_way());
        assert!(MessageType::SaveWithConfirm.is_two_way());
        assert!(!MessageType::Save.is_two_way());
        assert!(!MessageType::Notification.is_two_way());

        assert!(MessageType::DeleteAll.is_group_broadcast());
        assert!(MessageType::DeleteAll.is_cluster_broadcast());
        assert!(MessageType::DeleteInAllTypes.is_group_broadcast());
        assert!(!MessageType::DeleteInAllTypes.is_cluster_broadcast());
        assert!(MessageType::DeleteAllInType.is_cluster_broadcast());
        assert!(!MessageType::DeleteAllInType.is_group_broadcast());
    }

    #[test]
    fn default_ttl_is_two() {
        let msg = RelayMessage::new(MessageType::Save, 5, 42);
        assert_eq!(msg.relay_ttl, DEFAULT_RELAY_TTL);
        assert_eq!(msg.relay_ttl, 2);
        assert!(msg.outcome.is_none());
    }

    #[test]
    fn set_error_marks_outcome() {
        let mut msg = RelayMessage::new(MessageType::Get, 1, 1);
        msg.set_error(ErrorType::NoNodesAvailable);
        assert_eq!(msg.outcome, Some(Outcome::Error));
        assert!(msg.error_occurred());

        msg.set_error(ErrorType::None);
        assert!(!msg.error_occurred());
        // clearing the error leaves the outcome alone
        assert_eq!(msg.outcome, Some(Outcome::Error));
    }

    #[test]
    fn fault_classification() {
        let mut msg = RelayMessage::new(MessageType::Get, 1, 1);
        msg.set_fault(&TransportFault::new(FaultKind::ConnectionLost, "reset"));
        assert_eq!(msg.error, ErrorType::NodeUnreachable);

        msg.set_fault(&TransportFault::new(FaultKind::TimedOut, ""));
        assert_eq!(msg.error, ErrorType::TimedOut);
        assert_eq!(msg.outcome, Some(Outcome::Timeout));

        msg.set_fault(&TransportFault::new(FaultKind::ServerDown, ""));
        assert_eq!(msg.error, ErrorType::Unknown);
    }

    #[test]
    fn retry_policies() {
        let mut msg = RelayMessage::new(MessageType::Get, 1, 1);
        msg.set_error(ErrorType::NodeUnreachable);
        assert!(msg.is_retryable(RetryPolicy::UnreachableNodesOnly));
        assert!(msg.is_retryable(RetryPolicy::UnreachableNodesOrTimeout));

        msg.set_error(ErrorType::NodeInDangerZone);
        assert!(!msg.is_retryable(RetryPolicy::UnreachableNodesOnly));
        assert!(msg.is_retryable(RetryPolicy::UnreachableNodesOrTimeout));

        msg.set_fault(&TransportFault::new(FaultKind::TimedOut, ""));
        assert!(!msg.is_retryable(RetryPolicy::UnreachableNodesOnly));
        assert!(msg.is_retryable(RetryPolicy::UnreachableNodesOrTimeout));

        msg.set_error(ErrorType::Unknown);
        assert!(!msg.is_retryable(RetryPolicy::UnreachableNodesOnly));
    }

    #[test]
    fn reset_for_retry_restores_ttl() {
        let mut msg = RelayMessage::new(MessageType::Get, 1, 1);
        msg.relay_ttl -= 1;
        msg.set_error(ErrorType::NodeUnreachable);
        msg.reset_for_retry();
        assert_eq!(msg.relay_ttl, DEFAULT_RELAY_TTL);
        assert_eq!(msg.error, ErrorType::None);
        assert_eq!(msg.outcome, Some(Outcome::NotSent));
    }

    #[test]
    fn inter_zone_copy_gets_an_extra_hop() {
        let mut msg = RelayMessage::new(MessageType::Save, 3, 9).with_payload("v");
        msg.source_zone = 4;
        msg.add_address_to_history("10.0.0.1".parse().unwrap());
        msg.outcome = Some(Outcome::Queued);

        let copy = msg.inter_zone_copy();
        assert_eq!(copy.relay_ttl, msg.relay_ttl + 1);
        assert_eq!(copy.payload, msg.payload);
        assert_eq!(copy.source_zone, 4);
        assert_eq!(copy.address_history, msg.address_history);
        assert!(copy.outcome.is_none());
    }

    #[test]
    fn replicate_maps_confirmed_writes() {
        let msg = RelayMessage::new(MessageType::SaveWithConfirm, 5, 1).with_payload("x");
        let rep = msg.replicate().unwrap();
        assert_eq!(rep.message_type, MessageType::Save);
        assert_eq!(rep.relay_ttl, msg.relay_ttl - 1);

        let one_way = RelayMessage::new(MessageType::Delete, 5, 1);
        assert_eq!(one_way.replicate().unwrap(), one_way);

        assert!(RelayMessage::new(MessageType::Get, 5, 1).replicate().is_none());
        assert!(RelayMessage::new(MessageType::Query, 5, 1).replicate().is_none());
    }

    #[test]
    fn ttl_changes_saturate_at_the_bounds() {
        let mut top = RelayMessage::new(MessageType::Save, 5, 1);
        top.relay_ttl = i16::MAX;
        assert_eq!(top.inter_zone_copy().relay_ttl, i16::MAX);
        top.reset_for_retry();
        assert_eq!(top.relay_ttl, i16::MAX);

        let mut bottom = RelayMessage::new(MessageType::SaveWithConfirm, 5, 1);
        bottom.relay_ttl = i16::MIN;
        assert_eq!(bottom.replicate().unwrap().relay_ttl, i16::MIN);
    }
}
