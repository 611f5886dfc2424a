//! Transport fault taxonomy.
//!
//! A transport reports failure as one of a handful of fault kinds rather
//! than a raw error. Node health and message error codes are both derived
//! from the kind alone.

use std::fmt;
use std::io;

/// The closed set of ways a send to a node can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The host could not be reached or resolved.
    HostUnreachable,
    /// The connection was refused, reset or aborted.
    ConnectionLost,
    /// The node did not answer in time.
    TimedOut,
    /// Any other socket-level or remote failure.
    ServerDown,
    /// A failure that says nothing about the node's health.
    Other,
}

impl FaultKind {
    /// True for faults that mark a node unreachable.
    pub fn is_unreachable(self) -> bool {
        matches!(self, FaultKind::HostUnreachable | FaultKind::ConnectionLost)
    }

    /// True for faults that count toward the server-down window.
    pub fn is_server_down(self) -> bool {
        matches!(self, FaultKind::TimedOut | FaultKind::ServerDown)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::HostUnreachable => "host unreachable",
            FaultKind::ConnectionLost => "connection lost",
            FaultKind::TimedOut => "timed out",
            FaultKind::ServerDown => "server down",
            FaultKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A failed send, as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub kind: FaultKind,
    pub detail: String,
}

impl TransportFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for TransportFault {}

impl From<&io::Error> for TransportFault {
    fn from(e: &io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotFound => FaultKind::HostUnreachable,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => FaultKind::ConnectionLost,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FaultKind::TimedOut,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => FaultKind::Other,
            _ => FaultKind::ServerDown,
        };
        TransportFault::new(kind, e.to_string())
    }
}

impl From<io::Error> for TransportFault {
    fn from(e: io::Error) -> Self {
        TransportFault::from(&e)
    }
}
