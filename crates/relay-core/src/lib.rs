//! relay-core: the message model shared by every relay crate.
//!
//! Defines the typed message envelope that travels through the forwarder,
//! its wire-ready serialized form, the closed set of transport fault kinds,
//! the single "message dropped" channel, and a generic batching buffer
//! that coalesces one-way sends before they reach a transport.

pub mod batch;
mod error;
pub mod fault;
pub mod message;
mod notify;
mod serialized;

pub use batch::BatchedQueue;
pub use error::CodecError;
pub use fault::{FaultKind, TransportFault};
pub use message::{
    ErrorType, MessageType, Outcome, RelayMessage, RetryPolicy, DEFAULT_RELAY_TTL,
};
pub use notify::DropNotifier;
pub use serialized::SerializedMessage;
