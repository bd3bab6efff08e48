//! Per-connection I/O task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Frame, FrameEncoder};
use crate::peer::DisconnectReason;
use crate::service::Shared;
use crate::stream::MessageStream;

/// Drive one established connection until teardown.
///
/// The read side appends received bytes to the connection's message stream,
/// which decodes inline unless a dedicated worker owns the byte stream. The
/// write side drains the outbound frame queue. Exit removes the record and
/// emits the single `Disconnected` event through
/// [`Shared::finish_connection`].
pub(crate) async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    msg_stream: Arc<MessageStream>,
    mut frames_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    saw_bytes: Arc<AtomicBool>,
    shared: Arc<Shared>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let encoder = FrameEncoder::new(shared.config.magic, shared.config.large_threshold);
    let mut writer = FramedWrite::new(write_half, encoder);
    let mut chunk = BytesMut::with_capacity(shared.config.read_buffer);

    let reason = loop {
        tokio::select! {
            result = read_half.read_buf(&mut chunk) => match result {
                Ok(0) => {
                    debug!(peer = %peer, "Remote closed connection");
                    break DisconnectReason::RemoteClosed;
                }
                Ok(n) => {
                    trace!(peer = %peer, bytes = n, "Received bytes");
                    saw_bytes.store(true, Ordering::Relaxed);
                    if let Err(e) = msg_stream.feed(&chunk[..n]) {
                        debug!(peer = %peer, error = %e, "Decoder rejected byte stream");
                        break DisconnectReason::ProtocolError;
                    }
                    chunk.clear();
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Read failed");
                    break DisconnectReason::RemoteClosed;
                }
            },
            maybe_frame = frames_rx.recv() => match maybe_frame {
                Some(frame) => {
                    trace!(
                        peer = %peer,
                        command = %frame.command,
                        bytes = frame.body.len(),
                        "Sending frame"
                    );
                    if let Err(e) = writer.send(frame).await {
                        warn!(peer = %peer, error = %e, "Write failed");
                        break DisconnectReason::RemoteClosed;
                    }
                }
                // Record dropped without a cancel; treat as a local close.
                None => break DisconnectReason::Requested,
            },
            _ = cancel.cancelled() => {
                break if msg_stream.is_corrupted() {
                    DisconnectReason::ProtocolError
                } else {
                    DisconnectReason::Requested
                };
            }
        }
    };

    // Wakes any worker still blocked on this connection's bytes.
    msg_stream.close();
    shared.finish_connection(peer, reason);
}
