//! Peer lifecycle types.
//!
//! Peers are keyed by socket address. A peer is "pending" between the
//! local connect call and the transport confirming, and "established" once
//! a connection record exists; there is no record for closed peers.

use std::net::SocketAddr;
use std::time::Instant;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Outbound connect issued, transport not yet confirmed.
    Connecting,
    /// Connection live and decoding.
    Established,
    /// Teardown requested, tasks still winding down.
    Closing,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local code asked for the close.
    Requested,
    /// Remote side closed the transport.
    RemoteClosed,
    /// Decoder hit a terminal error on this connection's byte stream.
    ProtocolError,
    /// A post-connect policy layer rejected the peer.
    HandshakeLimit,
}

/// Why an outbound connection attempt never became a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Transport-level failure, with the underlying error text.
    Refused(String),
    /// No confirmation within the window.
    TimedOut,
    /// Connection table was full.
    AtCapacity,
}

/// Snapshot of one peer for status reporting.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// True for connections we dialed, false for accepted ones.
    pub outbound: bool,
    /// Whether any bytes have arrived since establishment.
    pub saw_bytes: bool,
    /// When the connection was established or the connect was issued.
    pub since: Instant,
}
