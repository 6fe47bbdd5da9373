//! Keel Error Types
//!
//! Errors surfaced by manager and connection operations. Transient I/O
//! conditions never show up here: the interfaces absorb them.

use std::io;
use thiserror::Error;

use crate::conn::ConnId;
use crate::endpoint::EndpointError;

/// Main error type for keel operations
#[derive(Error, Debug)]
pub enum KeelError {
    /// IO error reported by an interface
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint could not be parsed or used
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The connection handle is stale or was never issued
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnId),

    /// No interface registered at this index
    #[error("Unknown interface index {0}")]
    UnknownInterface(usize),

    /// Operation the selected interface does not implement
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Payload exceeds a configured bound
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// TLS backend failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Host name needs a resolver before it can be connected
    #[error("Cannot resolve host: {0}")]
    Resolve(String),

    /// Manager is tearing down and refuses new connections
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Broadcast channel is disconnected
    #[error("Broadcast channel closed")]
    ChannelClosed,
}

/// Result type alias for keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

impl KeelError {
    /// Create a not-supported error with a message
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create a TLS error with a message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a resolve error naming the host
    pub fn resolve(host: impl Into<String>) -> Self {
        Self::Resolve(host.into())
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::MessageTooLarge { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            Self::UnknownConnection(_) | Self::Tls(_) => true,
            _ => false,
        }
    }
}
