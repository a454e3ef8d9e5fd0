//! Client error type.

use bep_index::IndexError;
use bep_net::TransportError;
use bep_proto::ProtoError;
use bep_store::StoreError;
use thiserror::Error;

/// Errors raised by connections, transfers and the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The peer violated the protocol; the connection is unusable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation needs an established connection
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// No connected peer shares the folder
    #[error("No connection available for folder {0}")]
    NoConnection(String),

    /// A wait ran out of time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A block transfer failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A frame could not be written
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The transfer was cancelled by the caller
    #[error("Transfer cancelled")]
    Cancelled,

    /// The connection or client is closed
    #[error("Closed")]
    Closed,

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Index engine error
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Storage error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Wire format error
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Model error
    #[error(transparent)]
    Core(#[from] bep_core::CoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true for protocol violations, as opposed to transient failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol(_)
                | ClientError::Transport(TransportError::DeviceIdMismatch { .. })
                | ClientError::Proto(ProtoError::InvalidMagic(_))
        )
    }
}
