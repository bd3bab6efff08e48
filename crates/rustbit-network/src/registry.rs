//! Command-to-codec lookup.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;

use crate::buffer::BodyReader;
use crate::error::NetworkResult;

/// A decoded message body.
///
/// Concrete payload types live next to their codecs; consumers recover them
/// through [`Payload::as_any`] and `downcast_ref`.
pub trait Payload: fmt::Debug + Send + Sync + Any {
    /// Wire command this payload travels under.
    fn command(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Encoder/decoder pair for a message small enough to buffer whole.
pub trait PayloadCodec: Send + Sync {
    /// Decode a complete, checksum-verified body.
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>>;

    /// Append the payload's wire form to `dst`.
    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()>;
}

/// Incremental decoder for one oversized message body.
///
/// The dedicated worker calls [`ChunkDecoder::next_chunk`] repeatedly until
/// the body is exhausted. Each call blocks for bytes as needed and must
/// consume at least one byte; a zero-progress call is treated as a decode
/// failure to rule out infinite loops.
pub trait ChunkDecoder: Send {
    fn next_chunk(&mut self, body: &mut BodyReader<'_>) -> NetworkResult<Box<dyn Payload>>;
}

/// Factory producing a fresh [`ChunkDecoder`] per large message.
pub type ChunkDecoderFactory = Arc<dyn Fn() -> Box<dyn ChunkDecoder> + Send + Sync>;

#[derive(Default)]
struct RegistryEntry {
    sized: Option<Arc<dyn PayloadCodec>>,
    streaming: Option<ChunkDecoderFactory>,
}

/// Registry mapping command names to codecs.
///
/// Keys are lowercase; lookups through [`CommandName::lookup_key`] make
/// matching case-insensitive. A command may carry both a sized codec and a
/// streaming factory, in which case the decoder picks by declared body
/// length. Commands with no entry at all are skipped, not fatal.
///
/// [`CommandName::lookup_key`]: crate::codec::CommandName::lookup_key
#[derive(Default)]
pub struct MessageRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sized codec for `command`.
    pub fn register<C>(&self, command: &str, codec: C)
    where
        C: PayloadCodec + 'static,
    {
        self.entries
            .entry(command.to_ascii_lowercase())
            .or_default()
            .sized = Some(Arc::new(codec));
    }

    /// Register a streaming decoder factory for `command`.
    pub fn register_streaming<F>(&self, command: &str, factory: F)
    where
        F: Fn() -> Box<dyn ChunkDecoder> + Send + Sync + 'static,
    {
        self.entries
            .entry(command.to_ascii_lowercase())
            .or_default()
            .streaming = Some(Arc::new(factory));
    }

    /// Sized codec for a lowercase key, if any.
    pub fn codec(&self, key: &str) -> Option<Arc<dyn PayloadCodec>> {
        self.entries.get(key).and_then(|e| e.sized.clone())
    }

    /// Streaming factory for a lowercase key, if any.
    pub fn streaming(&self, key: &str) -> Option<ChunkDecoderFactory> {
        self.entries.get(key).and_then(|e| e.streaming.clone())
    }

    /// Whether any codec is registered under the key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Ping, PingCodec};

    #[test]
    fn test_register_and_lookup() {
        let registry = MessageRegistry::new();
        assert!(registry.is_empty());

        registry.register("ping", PingCodec);
        assert!(registry.contains("ping"));
        assert!(registry.codec("ping").is_some());
        assert!(registry.streaming("ping").is_none());
        assert!(registry.codec("pong").is_none());
    }

    #[test]
    fn test_keys_are_lowercased() {
        let registry = MessageRegistry::new();
        registry.register("PING", PingCodec);
        assert!(registry.codec("ping").is_some());
        assert!(registry.codec("PING").is_none());
    }

    #[test]
    fn test_sized_and_streaming_coexist() {
        struct NoopChunks;
        impl ChunkDecoder for NoopChunks {
            fn next_chunk(
                &mut self,
                body: &mut BodyReader<'_>,
            ) -> NetworkResult<Box<dyn Payload>> {
                let nonce = body.read_u64_le()?;
                Ok(Box::new(Ping { nonce }))
            }
        }

        let registry = MessageRegistry::new();
        registry.register("block", PingCodec);
        registry.register_streaming("block", || Box::new(NoopChunks));
        assert!(registry.codec("block").is_some());
        assert!(registry.streaming("block").is_some());
        assert_eq!(registry.len(), 1);
    }
}
