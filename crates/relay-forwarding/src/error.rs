use relay_core::CodecError;
use thiserror::Error;

/// Errors surfaced by the forwarder to its caller.
///
/// Two-way send failures are not errors at this level: they are recorded
/// on the message itself as an [`ErrorType`](relay_core::ErrorType).
#[derive(Debug, Error)]
pub enum ForwardError {
    /// A type configured for synchronous, non-queued one-way handling
    /// could not be delivered.
    #[error("sync operation failed: {0}")]
    SyncOperationFailure(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The forwarder was built outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid run state: {0}")]
    RunState(String),
}
