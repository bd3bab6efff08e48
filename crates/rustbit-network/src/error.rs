//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Network-related errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection attempt failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the remote side or torn down locally.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection table is full.
    #[error("Connection limit reached: {count}/{max}")]
    AtCapacity { count: usize, max: usize },

    /// No established connection for the given peer.
    #[error("Peer not connected: {0}")]
    PeerNotFound(SocketAddr),

    /// Header carried a magic value for a different network.
    #[error("Magic mismatch: expected {expected:#010x}, got {got:#010x}")]
    MagicMismatch { expected: u32, got: u32 },

    /// Malformed header, field, or payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Declared body length above the configured cap.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Body bytes did not hash to the header checksum.
    #[error("Checksum mismatch for '{command}'")]
    ChecksumMismatch { command: String },

    /// A large message named a command with no streaming decoder.
    #[error("No streaming decoder registered for '{0}'")]
    NoStreamingDecoder(String),

    /// No codec registered for an outbound payload.
    #[error("No codec registered for '{0}'")]
    NoCodec(String),

    /// Bytes stopped arriving in the middle of a message body.
    #[error("Byte stream starved for {waited:?} mid-message")]
    Starved { waited: Duration },

    /// Decoder already hit a terminal error on this connection.
    #[error("Decoder corrupted")]
    Corrupted,

    /// The network service event loop is no longer running.
    #[error("Network service stopped")]
    ServiceStopped,
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
