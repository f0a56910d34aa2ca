//! Error types for the command/response engine.

use thiserror::Error;

/// Errors that can occur when working with the engine.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed constructor or configuration input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A subscriber rejected the merged notification arguments.
    #[error("observer expected {expected} arguments, got {actual}")]
    ArgumentMismatch {
        /// Number of arguments the observer requires.
        expected: usize,
        /// Number of arguments it was invoked with.
        actual: usize,
    },

    /// A subscriber failed while handling a notification.
    #[error("observer failed during dispatch")]
    ObserverFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The expected response was not observed within the bound.
    #[error("timeout waiting for \"{0}\"")]
    Timeout(String),

    /// The wait was cancelled by link loss or an explicit shutdown.
    #[error("wait for \"{0}\" cancelled")]
    Cancelled(String),

    /// A command was invoked with no outgoing text configured.
    #[error("no outgoing command configured")]
    MissingCommand,

    /// A second invocation was attempted while the prior one is still pending.
    #[error("previous invocation still in progress")]
    CommandInProgress,

    /// The transport could not accept the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced from the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link is not open.
    #[error("link is not open")]
    NotOpen,

    /// The underlying I/O failed.
    #[error("link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port layer reported an error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Result type alias for engine operations.
pub type LinkResult<T> = Result<T, LinkError>;
