//! Reference message payloads and codecs.
//!
//! Covers the messages the engine itself exercises: keepalives, inventory
//! announcements, and block relay. Anything else can travel through
//! [`RawCodec`], which hands bodies through untouched.

use std::any::Any;

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::BodyReader;
use crate::error::{NetworkError, NetworkResult};
use crate::registry::{ChunkDecoder, MessageRegistry, Payload, PayloadCodec};
use crate::wire::{write_varint, Hash256, SliceReader};

/// Inventory lists above this are malformed by convention.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Size of the fixed block header inside a `block` body.
pub const BLOCK_HEADER_SIZE: usize = 80;

fn downcast<T: Payload>(payload: &dyn Payload) -> NetworkResult<&T> {
    payload.as_any().downcast_ref::<T>().ok_or_else(|| {
        NetworkError::InvalidMessage(format!(
            "payload does not match codec for '{}'",
            payload.command()
        ))
    })
}

/// Keepalive request carrying an echo nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

impl Ping {
    pub fn random() -> Self {
        Self {
            nonce: rand::random(),
        }
    }
}

impl Payload for Ping {
    fn command(&self) -> &str {
        "ping"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PingCodec;

impl PayloadCodec for PingCodec {
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        let nonce = SliceReader::new(body).read_u64_le()?;
        Ok(Box::new(Ping { nonce }))
    }

    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()> {
        dst.put_u64_le(downcast::<Ping>(payload)?.nonce);
        Ok(())
    }
}

/// Keepalive reply echoing a [`Ping`] nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

impl Payload for Pong {
    fn command(&self) -> &str {
        "pong"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PongCodec;

impl PayloadCodec for PongCodec {
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        let nonce = SliceReader::new(body).read_u64_le()?;
        Ok(Box::new(Pong { nonce }))
    }

    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()> {
        dst.put_u64_le(downcast::<Pong>(payload)?.nonce);
        Ok(())
    }
}

/// Bare acknowledgement with an empty body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verack;

impl Payload for Verack {
    fn command(&self) -> &str {
        "verack"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct VerackCodec;

impl PayloadCodec for VerackCodec {
    fn decode(&self, _body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        Ok(Box::new(Verack))
    }

    fn encode(&self, payload: &dyn Payload, _dst: &mut BytesMut) -> NetworkResult<()> {
        downcast::<Verack>(payload)?;
        Ok(())
    }
}

/// Inventory item type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
    FilteredBlock,
    Other(u32),
}

impl InvKind {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => Self::Tx,
            2 => Self::Block,
            3 => Self::FilteredBlock,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Tx => 1,
            Self::Block => 2,
            Self::FilteredBlock => 3,
            Self::Other(raw) => raw,
        }
    }
}

/// One announced or requested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvEntry {
    pub kind: InvKind,
    pub hash: Hash256,
}

fn read_entries(reader: &mut SliceReader<'_>) -> NetworkResult<Vec<InvEntry>> {
    let count = reader.read_varint()?;
    if count > MAX_INV_ENTRIES {
        return Err(NetworkError::InvalidMessage(format!(
            "inventory lists {count} entries, cap is {MAX_INV_ENTRIES}"
        )));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = InvKind::from_wire(reader.read_u32_le()?);
        let hash = reader.read_hash()?;
        entries.push(InvEntry { kind, hash });
    }
    if reader.remaining() > 0 {
        return Err(NetworkError::InvalidMessage(format!(
            "{} bytes after final inventory entry",
            reader.remaining()
        )));
    }
    Ok(entries)
}

fn write_entries(entries: &[InvEntry], dst: &mut BytesMut) {
    write_varint(dst, entries.len() as u64);
    for entry in entries {
        dst.put_u32_le(entry.kind.to_wire());
        entry.hash.write_to(dst);
    }
}

/// `inv` announcement listing items a peer has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub entries: Vec<InvEntry>,
}

impl Payload for Inventory {
    fn command(&self) -> &str {
        "inv"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct InvCodec;

impl PayloadCodec for InvCodec {
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        let entries = read_entries(&mut SliceReader::new(body))?;
        Ok(Box::new(Inventory { entries }))
    }

    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()> {
        write_entries(&downcast::<Inventory>(payload)?.entries, dst);
        Ok(())
    }
}

/// `getdata` request for previously announced items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetData {
    pub entries: Vec<InvEntry>,
}

impl Payload for GetData {
    fn command(&self) -> &str {
        "getdata"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct GetDataCodec;

impl PayloadCodec for GetDataCodec {
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        let entries = read_entries(&mut SliceReader::new(body))?;
        Ok(Box::new(GetData { entries }))
    }

    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()> {
        write_entries(&downcast::<GetData>(payload)?.entries, dst);
        Ok(())
    }
}

/// Opaque pass-through payload for commands without a structured codec.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub command: String,
    pub bytes: Bytes,
}

impl Payload for RawPayload {
    fn command(&self) -> &str {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pass-through codec bound to one command name.
pub struct RawCodec {
    command: String,
}

impl RawCodec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl PayloadCodec for RawCodec {
    fn decode(&self, body: &[u8]) -> NetworkResult<Box<dyn Payload>> {
        Ok(Box::new(RawPayload {
            command: self.command.clone(),
            bytes: Bytes::copy_from_slice(body),
        }))
    }

    fn encode(&self, payload: &dyn Payload, dst: &mut BytesMut) -> NetworkResult<()> {
        dst.put_slice(&downcast::<RawPayload>(payload)?.bytes);
        Ok(())
    }
}

/// First chunk of a streamed block: the 80-byte header fields plus the
/// declared transaction count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStart {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub tx_count: u64,
}

impl Payload for BlockStart {
    fn command(&self) -> &str {
        "block"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A batch of raw transactions from a streamed block, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTxBatch {
    /// Index of the first transaction in this batch.
    pub start_index: u64,
    pub txs: Vec<Bytes>,
}

impl Payload for BlockTxBatch {
    fn command(&self) -> &str {
        "block"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum BlockDecodeState {
    Header,
    Txs { next_index: u64, remaining: u64 },
}

/// Streaming block decoder: one [`BlockStart`] chunk, then transactions in
/// [`BlockTxBatch`] chunks of up to `batch` each.
pub struct BlockChunkDecoder {
    batch: u64,
    state: BlockDecodeState,
}

impl BlockChunkDecoder {
    pub fn new(batch: usize) -> Self {
        Self {
            batch: (batch.max(1)) as u64,
            state: BlockDecodeState::Header,
        }
    }
}

impl ChunkDecoder for BlockChunkDecoder {
    fn next_chunk(&mut self, body: &mut BodyReader<'_>) -> NetworkResult<Box<dyn Payload>> {
        match self.state {
            BlockDecodeState::Header => {
                let version = body.read_i32_le()?;
                let prev_block = body.read_hash()?;
                let merkle_root = body.read_hash()?;
                let timestamp = body.read_u32_le()?;
                let bits = body.read_u32_le()?;
                let nonce = body.read_u32_le()?;
                let tx_count = body.read_varint()?;
                self.state = BlockDecodeState::Txs {
                    next_index: 0,
                    remaining: tx_count,
                };
                Ok(Box::new(BlockStart {
                    version,
                    prev_block,
                    merkle_root,
                    timestamp,
                    bits,
                    nonce,
                    tx_count,
                }))
            }
            BlockDecodeState::Txs {
                next_index,
                remaining,
            } => {
                if remaining == 0 {
                    return Err(NetworkError::InvalidMessage(format!(
                        "{} bytes after final transaction",
                        body.remaining()
                    )));
                }
                let take = self.batch.min(remaining);
                let mut txs = Vec::with_capacity(take as usize);
                for _ in 0..take {
                    txs.push(read_raw_tx(body)?);
                }
                self.state = BlockDecodeState::Txs {
                    next_index: next_index + take,
                    remaining: remaining - take,
                };
                Ok(Box::new(BlockTxBatch {
                    start_index: next_index,
                    txs,
                }))
            }
        }
    }
}

fn copy_u8(body: &mut BodyReader<'_>, out: &mut BytesMut) -> NetworkResult<u8> {
    let byte = body.read_u8()?;
    out.put_u8(byte);
    Ok(byte)
}

fn copy_bytes(body: &mut BodyReader<'_>, out: &mut BytesMut, n: usize) -> NetworkResult<()> {
    let bytes = body.read_bytes(n)?;
    out.put_slice(&bytes);
    Ok(())
}

fn checked_len(value: u64) -> NetworkResult<usize> {
    usize::try_from(value)
        .map_err(|_| NetworkError::InvalidMessage(format!("length {value} overflows")))
}

/// Read a CompactSize value while echoing its exact encoding into `out`.
///
/// Transactions are re-emitted byte for byte, so a non-minimal varint must
/// survive the copy unchanged.
fn copy_varint(body: &mut BodyReader<'_>, out: &mut BytesMut) -> NetworkResult<u64> {
    let marker = copy_u8(body, out)?;
    match marker {
        0xFD => {
            let b = body.read_bytes(2)?;
            out.put_slice(&b);
            Ok(u64::from(u16::from_le_bytes([b[0], b[1]])))
        }
        0xFE => {
            let b = body.read_bytes(4)?;
            out.put_slice(&b);
            Ok(u64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        }
        0xFF => {
            let b = body.read_bytes(8)?;
            out.put_slice(&b);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b);
            Ok(u64::from_le_bytes(raw))
        }
        direct => Ok(u64::from(direct)),
    }
}

/// Parse one transaction off the body, returning its exact wire bytes.
///
/// Boundaries only: scripts and witness items stay opaque. A zero where
/// the input count belongs marks the segwit marker/flag form, since no
/// valid transaction has zero inputs.
fn read_raw_tx(body: &mut BodyReader<'_>) -> NetworkResult<Bytes> {
    let mut out = BytesMut::new();
    copy_bytes(body, &mut out, 4)?; // version
    let mut input_count = copy_varint(body, &mut out)?;
    let segwit = input_count == 0;
    if segwit {
        let flag = copy_u8(body, &mut out)?;
        if flag != 1 {
            return Err(NetworkError::InvalidMessage(format!(
                "bad segwit flag {flag:#04x}"
            )));
        }
        input_count = copy_varint(body, &mut out)?;
        if input_count == 0 {
            return Err(NetworkError::InvalidMessage(
                "transaction has no inputs".to_string(),
            ));
        }
    }
    for _ in 0..input_count {
        copy_bytes(body, &mut out, 36)?; // previous outpoint
        let script_len = copy_varint(body, &mut out)?;
        copy_bytes(body, &mut out, checked_len(script_len)?)?;
        copy_bytes(body, &mut out, 4)?; // sequence
    }
    let output_count = copy_varint(body, &mut out)?;
    for _ in 0..output_count {
        copy_bytes(body, &mut out, 8)?; // value
        let script_len = copy_varint(body, &mut out)?;
        copy_bytes(body, &mut out, checked_len(script_len)?)?;
    }
    if segwit {
        for _ in 0..input_count {
            let items = copy_varint(body, &mut out)?;
            for _ in 0..items {
                let item_len = copy_varint(body, &mut out)?;
                copy_bytes(body, &mut out, checked_len(item_len)?)?;
            }
        }
    }
    copy_bytes(body, &mut out, 4)?; // lock time
    Ok(out.freeze())
}

/// Register the reference codecs.
///
/// Blocks below the large threshold arrive whole as [`RawPayload`] bodies;
/// larger ones stream through [`BlockChunkDecoder`] in batches of
/// `tx_batch` transactions.
pub fn install_reference_codecs(registry: &MessageRegistry, tx_batch: usize) {
    registry.register("ping", PingCodec);
    registry.register("pong", PongCodec);
    registry.register("verack", VerackCodec);
    registry.register("inv", InvCodec);
    registry.register("getdata", GetDataCodec);
    registry.register("block", RawCodec::new("block"));
    registry.register_streaming("block", move || Box::new(BlockChunkDecoder::new(tx_batch)));
}
