//! Peer-to-peer networking engine.
//!
//! The engine accepts and dials TCP peers, frames messages with a 24-byte
//! magic/command/length/checksum header, and decodes inbound byte streams
//! adaptively: small messages are buffered and decoded inline, while bodies
//! at or above a configurable threshold are streamed through a dedicated
//! worker thread that publishes partial results as chunks arrive.
//!
//! [`NetworkService`] owns the event loop; callers keep the
//! [`NetworkHandle`] and the event receiver it hands back. Message formats
//! are pluggable through the [`MessageRegistry`].

mod buffer;
mod codec;
mod connection;
mod decoder;
pub mod discovery;
mod error;
pub mod messages;
mod peer;
mod registry;
mod service;
mod stream;
mod wire;

pub use buffer::{BodyReader, ByteQueue};
pub use codec::{checksum, CommandName, Frame, FrameEncoder, MessageHeader, COMMAND_SIZE, HEADER_SIZE};
pub use decoder::{DecoderConfig, MessageDecoder};
pub use error::{NetworkError, NetworkResult};
pub use peer::{DisconnectReason, PeerInfo, PeerState, RejectReason};
pub use registry::{ChunkDecoder, ChunkDecoderFactory, MessageRegistry, Payload, PayloadCodec};
pub use service::{
    NetworkCommand, NetworkConfig, NetworkEvent, NetworkHandle, NetworkService,
};
pub use stream::{encode_frame, MessageStream};
pub use wire::{varint_len, write_varint, Hash256, SliceReader};

/// Magic bytes 0xF9BEB4D9 as a little-endian word.
pub const MAINNET_MAGIC: u32 = 0xD9B4_BEF9;

/// Magic bytes 0x0B110907 as a little-endian word.
pub const TESTNET_MAGIC: u32 = 0x0709_110B;

/// Magic bytes 0xFABFB5DA as a little-endian word.
pub const REGTEST_MAGIC: u32 = 0xDAB5_BFFA;

/// Default mainnet listen port.
pub const DEFAULT_PORT: u16 = 8333;

/// Protocol version advertised by this implementation.
pub const PROTOCOL_VERSION: u32 = 70016;

/// User agent advertised by this implementation.
pub const USER_AGENT: &str = "/rustbit:0.1.0/";
