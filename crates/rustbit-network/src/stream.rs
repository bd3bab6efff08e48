//! Per-connection message stream.
//!
//! Binds a connection's byte queue to its decoder and the shared codec
//! registry. The reader task owns one of these per connection; status
//! surfaces and teardown go through it as well.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::ByteQueue;
use crate::codec::{CommandName, Frame};
use crate::decoder::{DecoderConfig, MessageDecoder};
use crate::error::{NetworkError, NetworkResult};
use crate::registry::{MessageRegistry, Payload};
use crate::service::NetworkEvent;

/// Encode a payload into an outbound frame using its registered codec.
pub fn encode_frame(registry: &MessageRegistry, payload: &dyn Payload) -> NetworkResult<Frame> {
    let command = CommandName::new(payload.command())?;
    let Some(codec) = registry.codec(&command.lookup_key()) else {
        return Err(NetworkError::NoCodec(command.to_string()));
    };
    let mut body = BytesMut::new();
    codec.encode(payload, &mut body)?;
    Ok(Frame::new(command, body.freeze()))
}

/// One connection's inbound decode pipeline plus outbound encode support.
pub struct MessageStream {
    peer: SocketAddr,
    queue: Arc<ByteQueue>,
    decoder: Arc<MessageDecoder>,
    registry: Arc<MessageRegistry>,
}

impl MessageStream {
    pub fn new(
        peer: SocketAddr,
        config: DecoderConfig,
        registry: Arc<MessageRegistry>,
        events: mpsc::UnboundedSender<NetworkEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(ByteQueue::new());
        let decoder = MessageDecoder::new(
            peer,
            config,
            Arc::clone(&registry),
            Arc::clone(&queue),
            events,
            cancel,
        );
        Arc::new(Self {
            peer,
            queue,
            decoder,
            registry,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Append received bytes and decode whatever is now complete.
    pub fn feed(&self, bytes: &[u8]) -> NetworkResult<()> {
        self.queue.append(bytes);
        self.decoder.drive()
    }

    /// Encode a payload for this connection's outbound side.
    pub fn encode_frame(&self, payload: &dyn Payload) -> NetworkResult<Frame> {
        encode_frame(&self.registry, payload)
    }

    /// Bytes received but not yet consumed by the decoder.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.decoder.is_streaming()
    }

    pub fn is_corrupted(&self) -> bool {
        self.decoder.is_corrupted()
    }

    /// Close the byte queue, waking any worker blocked on it.
    pub fn close(&self) {
        self.queue.close();
    }
}
