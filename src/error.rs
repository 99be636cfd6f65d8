//! Error types for connection and packet operations.

use std::io;
use thiserror::Error;

/// Errors that can occur on connections, codecs, pools and servers.
#[derive(Error, Debug)]
pub enum NetError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// Payload larger than the configured maximum.
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A received header declared a length outside the allowed range.
    #[error("Invalid packet length {length}, allowed maximum is {max}")]
    InvalidPacketLength { length: usize, max: usize },

    /// Packet header size outside 1..=4.
    #[error("Invalid packet header size {0}, expected 1 to 4 bytes")]
    InvalidHeaderSize(usize),

    /// Maximum data size above the hard limit.
    #[error("Invalid max data size {size}, hard limit is {limit}")]
    InvalidMaxDataSize { size: usize, limit: usize },

    /// A datagram send without any known destination.
    #[error("No remote address to send to")]
    NoRemoteAddr,

    /// Server started without a connection handler.
    #[error("Server has no connection handler")]
    NoHandler,

    /// Operation not allowed in the current server state.
    #[error("Invalid server state: {0}")]
    InvalidState(String),
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    /// Build a `NetError` from an I/O error, classifying timeouts and EOF.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }

    /// Check if this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }

    /// Check if the connection can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Check if this error is recoverable (transient).
    ///
    /// Retry policies are only consulted for recoverable errors.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout)
    }
}

pub(crate) fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
