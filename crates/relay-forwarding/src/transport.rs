//! The contract between the forwarder and whatever carries bytes to a
//! node.
//!
//! A transport only reports success or a classified [`TransportFault`].
//! Timeouts are the transport's business; the forwarder reacts to the
//! fault it is handed.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Outcome, RelayMessage, SerializedMessage, TransportFault};

use crate::config::NodeDefinition;

/// Sends messages to one node.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one already-encoded one-way message.
    async fn send_in(&self, message: &SerializedMessage) -> Result<(), TransportFault>;

    /// Delivers a list of one-way messages in a single round trip.
    async fn send_in_list(&self, messages: &[SerializedMessage]) -> Result<(), TransportFault>;

    /// Sends a live message and waits for its reply. On success the
    /// transport fills in the reply fields and the outcome.
    async fn send_message(&self, message: &mut RelayMessage) -> Result<(), TransportFault>;

    /// Sends a list of two-way messages and fills in each reply.
    async fn send_out_list(&self, messages: &mut [RelayMessage]) -> Result<(), TransportFault>;
}

/// Builds the transport for each node when a topology is loaded.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, node: &NodeDefinition) -> Arc<dyn Transport>;
}

/// Accepts everything and goes nowhere. Stands in for nodes whose host
/// doesn't resolve.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send_in(&self, _message: &SerializedMessage) -> Result<(), TransportFault> {
        Ok(())
    }

    async fn send_in_list(&self, _messages: &[SerializedMessage]) -> Result<(), TransportFault> {
        Ok(())
    }

    async fn send_message(&self, message: &mut RelayMessage) -> Result<(), TransportFault> {
        message.outcome = Some(Outcome::NotSent);
        Ok(())
    }

    async fn send_out_list(&self, messages: &mut [RelayMessage]) -> Result<(), TransportFault> {
        for message in messages {
            message.outcome = Some(Outcome::NotSent);
        }
        Ok(())
    }
}
