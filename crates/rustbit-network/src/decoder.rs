//! Adaptive streaming message decoder.
//!
//! One decoder per connection turns the connection's raw byte stream into
//! discrete messages, regardless of how the transport chunked the bytes.
//! Small messages are buffered, checksum-verified and decoded inline by
//! whichever reader task appended the bytes. Messages whose declared body
//! length reaches the configured threshold are handed to a dedicated worker
//! thread that decodes incrementally and publishes partial results, while
//! the reader task keeps feeding the buffer.
//!
//! Exactly one party decodes at a time. The `streaming` flag is the
//! ownership token: the reader task drives the decoder only while the flag
//! is clear, and the worker owns the byte stream while it is set. The flag
//! is cleared under the state lock with a final drain, so bytes that arrive
//! during the handback are decoded by exactly one side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::{BodyReader, ByteQueue};
use crate::codec::{checksum, CommandName, MessageHeader, HEADER_SIZE};
use crate::error::{NetworkError, NetworkResult};
use crate::registry::{ChunkDecoderFactory, MessageRegistry};
use crate::service::NetworkEvent;
use crate::MAINNET_MAGIC;

/// Decode-path settings, extracted from the service configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Expected network magic.
    pub magic: u32,
    /// Bodies at or above this many bytes go to a dedicated worker.
    pub large_threshold: usize,
    /// Hard cap on declared body length.
    pub max_message_size: usize,
    /// Per-wait starvation timeout for streamed bodies.
    pub stream_read_timeout: Duration,
    /// Verify checksums on buffered bodies.
    pub verify_checksums: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            large_threshold: 2 * 1024 * 1024,
            max_message_size: 1024 * 1024 * 1024,
            stream_read_timeout: Duration::from_secs(30),
            verify_checksums: true,
        }
    }
}

/// Where the decoder is within the current message.
enum DecodePhase {
    /// Waiting for a complete 24-byte header.
    SeekHeader,
    /// Header parsed, waiting for the full body.
    SeekBody(MessageHeader),
    /// Unregistered command, discarding its body as bytes arrive.
    IgnoreBody { command: CommandName, remaining: usize },
    /// A dedicated worker owns the byte stream.
    Streaming,
    /// Terminal. The byte stream can no longer be trusted.
    Corrupted,
}

/// Per-connection decoder state machine.
pub struct MessageDecoder {
    peer: SocketAddr,
    config: DecoderConfig,
    registry: Arc<MessageRegistry>,
    queue: Arc<ByteQueue>,
    state: Mutex<DecodePhase>,
    /// Set while a dedicated worker owns the byte stream.
    streaming: AtomicBool,
    /// Latched on the first terminal decode error.
    corrupted: AtomicBool,
    events: mpsc::UnboundedSender<NetworkEvent>,
    cancel: CancellationToken,
    me: Weak<MessageDecoder>,
}

impl MessageDecoder {
    pub fn new(
        peer: SocketAddr,
        config: DecoderConfig,
        registry: Arc<MessageRegistry>,
        queue: Arc<ByteQueue>,
        events: mpsc::UnboundedSender<NetworkEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            peer,
            config,
            registry,
            queue,
            state: Mutex::new(DecodePhase::SeekHeader),
            streaming: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            events,
            cancel,
            me: me.clone(),
        })
    }

    /// Decode whatever complete pieces the queue now holds.
    ///
    /// Called by the reader task after appending bytes. Does nothing while
    /// a worker owns the stream; returns an error once the decoder is
    /// corrupted so the caller can tear the connection down.
    pub fn drive(&self) -> NetworkResult<()> {
        if self.corrupted.load(Ordering::SeqCst) {
            return Err(NetworkError::Corrupted);
        }
        if self.streaming.load(Ordering::SeqCst) {
            // The append already woke the worker.
            return Ok(());
        }
        let mut state = self.state.lock();
        self.drain(&mut state)
    }

    /// True while a dedicated worker owns the byte stream.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// True once a terminal decode error was hit.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::SeqCst)
    }

    /// Run the state machine until it needs more bytes.
    fn drain(&self, state: &mut DecodePhase) -> NetworkResult<()> {
        loop {
            match std::mem::replace(state, DecodePhase::SeekHeader) {
                DecodePhase::SeekHeader => {
                    let mut raw = [0u8; HEADER_SIZE];
                    if !self.queue.peek(&mut raw) {
                        return Ok(());
                    }
                    let header = match MessageHeader::parse(&raw, self.config.magic) {
                        Ok(header) => header,
                        Err(e) => return Err(self.fail(state, e)),
                    };
                    let body_len = header.length as usize;
                    if body_len > self.config.max_message_size {
                        return Err(self.fail(
                            state,
                            NetworkError::MessageTooLarge {
                                size: body_len,
                                max: self.config.max_message_size,
                            },
                        ));
                    }
                    self.queue.discard(HEADER_SIZE);
                    if body_len >= self.config.large_threshold {
                        let key = header.command.lookup_key();
                        let Some(factory) = self.registry.streaming(&key) else {
                            return Err(self.fail(state, NetworkError::NoStreamingDecoder(key)));
                        };
                        *state = DecodePhase::Streaming;
                        return self.start_streaming(state, header, factory);
                    }
                    if self.registry.codec(&header.command.lookup_key()).is_some() {
                        *state = DecodePhase::SeekBody(header);
                    } else {
                        debug!(
                            peer = %self.peer,
                            command = %header.command,
                            length = header.length,
                            "Unknown command, discarding body"
                        );
                        *state = DecodePhase::IgnoreBody {
                            command: header.command,
                            remaining: body_len,
                        };
                    }
                }
                DecodePhase::SeekBody(header) => {
                    let Some(body) = self.queue.take(header.length as usize) else {
                        *state = DecodePhase::SeekBody(header);
                        return Ok(());
                    };
                    if self.config.verify_checksums && checksum(&body) != header.checksum {
                        return Err(self.fail(
                            state,
                            NetworkError::ChecksumMismatch {
                                command: header.command.to_string(),
                            },
                        ));
                    }
                    let Some(codec) = self.registry.codec(&header.command.lookup_key()) else {
                        // Codec dropped between header and body. Skip the
                        // message like any other unregistered command.
                        continue;
                    };
                    match codec.decode(&body) {
                        Ok(payload) => {
                            trace!(
                                peer = %self.peer,
                                command = %header.command,
                                length = header.length,
                                "Decoded message"
                            );
                            self.publish(NetworkEvent::Message {
                                peer: self.peer,
                                header,
                                payload,
                            });
                        }
                        Err(e) => return Err(self.fail(state, e)),
                    }
                }
                DecodePhase::IgnoreBody {
                    command,
                    mut remaining,
                } => {
                    remaining -= self.queue.discard(remaining);
                    if remaining > 0 {
                        *state = DecodePhase::IgnoreBody { command, remaining };
                        return Ok(());
                    }
                    trace!(peer = %self.peer, command = %command, "Discarded unregistered message");
                }
                DecodePhase::Streaming => {
                    // A worker handed back concurrently with this drive.
                    *state = DecodePhase::Streaming;
                    return Ok(());
                }
                DecodePhase::Corrupted => {
                    *state = DecodePhase::Corrupted;
                    return Err(NetworkError::Corrupted);
                }
            }
        }
    }

    /// Hand the byte stream to a dedicated worker thread.
    ///
    /// Caller holds the state lock and has already set the phase to
    /// `Streaming`; the flag is set before the thread starts so the reader
    /// task stops driving immediately.
    fn start_streaming(
        &self,
        state: &mut DecodePhase,
        header: MessageHeader,
        factory: ChunkDecoderFactory,
    ) -> NetworkResult<()> {
        let Some(decoder) = self.me.upgrade() else {
            return Ok(());
        };
        self.streaming.store(true, Ordering::SeqCst);
        debug!(
            peer = %self.peer,
            command = %header.command,
            length = header.length,
            "Handing byte stream to dedicated decode worker"
        );
        let spawned = std::thread::Builder::new()
            .name(format!("stream-decode-{}", self.peer))
            .spawn(move || decoder.run_streaming(header, factory));
        if let Err(e) = spawned {
            self.streaming.store(false, Ordering::SeqCst);
            return Err(self.fail(state, NetworkError::Io(e)));
        }
        Ok(())
    }

    /// Worker thread body: stream one large message, then hand ownership
    /// back and drain anything that queued up in the meantime.
    fn run_streaming(&self, header: MessageHeader, factory: ChunkDecoderFactory) {
        let result = self.stream_body(&header, factory);
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                *state = DecodePhase::SeekHeader;
                self.streaming.store(false, Ordering::SeqCst);
                // Errors here latch and publish through fail(); the reader
                // task sees the corrupted flag on its next drive.
                let _ = self.drain(&mut state);
            }
            Err(e) => {
                self.streaming.store(false, Ordering::SeqCst);
                if matches!(e, NetworkError::ConnectionClosed) && self.queue.is_closed() {
                    // Teardown closed the queue under the worker. Latch
                    // quietly; this is not a decode failure.
                    *state = DecodePhase::Corrupted;
                    self.corrupted.store(true, Ordering::SeqCst);
                } else {
                    let _ = self.fail(&mut state, e);
                }
            }
        }
    }

    /// Decode one large body chunk by chunk, publishing each batch.
    fn stream_body(
        &self,
        header: &MessageHeader,
        factory: ChunkDecoderFactory,
    ) -> NetworkResult<()> {
        let mut chunker = factory();
        let mut body = BodyReader::new(
            &self.queue,
            header.length as usize,
            self.config.stream_read_timeout,
        );
        let mut sequence = 0u32;
        while body.remaining() > 0 {
            let before = body.remaining();
            let chunk = chunker.next_chunk(&mut body)?;
            if body.remaining() == before {
                return Err(NetworkError::InvalidMessage(format!(
                    "streaming decoder for '{}' consumed no bytes",
                    header.command
                )));
            }
            let done = body.remaining() == 0;
            self.publish(NetworkEvent::MessageChunk {
                peer: self.peer,
                header: header.clone(),
                chunk,
                sequence,
                done,
            });
            sequence += 1;
        }
        debug!(
            peer = %self.peer,
            command = %header.command,
            length = header.length,
            chunks = sequence,
            "Streamed large message"
        );
        Ok(())
    }

    /// Latch the terminal state. The first failure publishes one
    /// `DecodeError` event and cancels the connection; repeats are silent.
    fn fail(&self, state: &mut DecodePhase, error: NetworkError) -> NetworkError {
        *state = DecodePhase::Corrupted;
        if !self.corrupted.swap(true, Ordering::SeqCst) {
            warn!(peer = %self.peer, error = %error, "Decode failed, corrupting connection");
            self.publish(NetworkEvent::DecodeError {
                peer: self.peer,
                detail: error.to_string(),
            });
            self.cancel.cancel();
        }
        error
    }

    fn publish(&self, event: NetworkEvent) {
        // The subscriber may already be gone during shutdown.
        let _ = self.events.send(event);
    }
}
