//! Wire-format test data builders.
//!
//! Frames are assembled by hand rather than through the production encoder,
//! so the parsers under test face independently constructed bytes.

use bytes::BytesMut;

use rustbit_network::{checksum, write_varint, COMMAND_SIZE, HEADER_SIZE};

/// Build a complete frame: header with a valid checksum, then the body.
pub fn frame_bytes(magic: u32, command: &str, body: &[u8]) -> Vec<u8> {
    frame_bytes_with_checksum(magic, command, body, checksum(body))
}

/// Build a frame with an explicit checksum field.
///
/// Streamed large messages travel with a zeroed checksum; corruption tests
/// want a wrong one.
pub fn frame_bytes_with_checksum(
    magic: u32,
    command: &str,
    body: &[u8],
    check: [u8; 4],
) -> Vec<u8> {
    assert!(command.len() <= COMMAND_SIZE, "command too long for header");
    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(&magic.to_le_bytes());
    let mut padded = [0u8; COMMAND_SIZE];
    padded[..command.len()].copy_from_slice(command.as_bytes());
    bytes.extend_from_slice(&padded);
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&check);
    bytes.extend_from_slice(body);
    bytes
}

/// A ping frame for the given network and nonce.
pub fn ping_frame(magic: u32, nonce: u64) -> Vec<u8> {
    frame_bytes(magic, "ping", &nonce.to_le_bytes())
}

/// Append a CompactSize integer to a plain byte vector.
pub fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = BytesMut::new();
    write_varint(&mut buf, value);
    out.extend_from_slice(&buf);
}

/// A minimal legacy transaction with one input and one output.
///
/// The seed colors the outpoint and scripts so transactions are
/// distinguishable when reassembled.
pub fn legacy_tx(seed: u8, script_len: usize) -> Vec<u8> {
    let mut tx = Vec::new();
    tx.extend_from_slice(&1i32.to_le_bytes()); // version
    tx.push(1); // input count
    let mut outpoint = [0u8; 36];
    outpoint[0] = seed;
    tx.extend_from_slice(&outpoint);
    push_varint(&mut tx, script_len as u64);
    tx.extend(std::iter::repeat(seed).take(script_len));
    tx.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // sequence
    tx.push(1); // output count
    tx.extend_from_slice(&50_000u64.to_le_bytes()); // value
    push_varint(&mut tx, 25);
    tx.extend(std::iter::repeat(seed ^ 0xFF).take(25));
    tx.extend_from_slice(&0u32.to_le_bytes()); // lock time
    tx
}

/// A block body: 80-byte header, transaction count, then the transactions.
pub fn block_body(txs: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&2i32.to_le_bytes()); // version
    body.extend(std::iter::repeat(0x11).take(32)); // previous block
    body.extend(std::iter::repeat(0x22).take(32)); // merkle root
    body.extend_from_slice(&1_700_000_000u32.to_le_bytes()); // timestamp
    body.extend_from_slice(&0x1D00_FFFFu32.to_le_bytes()); // bits
    body.extend_from_slice(&7u32.to_le_bytes()); // nonce
    push_varint(&mut body, txs.len() as u64);
    for tx in txs {
        body.extend_from_slice(tx);
    }
    body
}

/// A block frame sized for the streaming path, plus its body.
///
/// Carries a zeroed checksum, as large frames do on the wire.
pub fn large_block_frame(magic: u32, tx_count: usize, script_len: usize) -> (Vec<u8>, Vec<u8>) {
    let txs: Vec<Vec<u8>> = (0..tx_count)
        .map(|i| legacy_tx(i as u8, script_len))
        .collect();
    let body = block_body(&txs);
    let frame = frame_bytes_with_checksum(magic, "block", &body, [0u8; 4]);
    (frame, body)
}

/// Split `bytes` at the given cut points into delivery chunks.
///
/// Cuts must be sorted; out-of-range or duplicate cuts are ignored, so the
/// chunks always concatenate back to the input.
pub fn split_at_points(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut last = 0usize;
    for &cut in cuts {
        let cut = cut.min(bytes.len());
        if cut > last {
            chunks.push(bytes[last..cut].to_vec());
            last = cut;
        }
    }
    if last < bytes.len() {
        chunks.push(bytes[last..].to_vec());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustbit_network::REGTEST_MAGIC;

    #[test]
    fn test_frame_layout() {
        let frame = ping_frame(REGTEST_MAGIC, 7);
        assert_eq!(frame.len(), HEADER_SIZE + 8);
        assert_eq!(&frame[..4], &REGTEST_MAGIC.to_le_bytes());
        assert_eq!(&frame[4..8], b"ping");
        assert_eq!(&frame[16..20], &8u32.to_le_bytes());
        assert_eq!(&frame[20..24], &checksum(&frame[24..]));
    }

    #[test]
    fn test_block_body_layout() {
        let txs = vec![legacy_tx(1, 10), legacy_tx(2, 10)];
        let body = block_body(&txs);
        assert_eq!(body.len(), 80 + 1 + txs[0].len() + txs[1].len());
        assert_eq!(body[80], 2); // transaction count
    }

    #[test]
    fn test_split_covers_all_bytes() {
        let bytes: Vec<u8> = (0..50).collect();
        for cuts in [vec![], vec![1, 2, 3], vec![0, 25, 25, 999], vec![49, 50]] {
            let chunks = split_at_points(&bytes, &cuts);
            let rejoined: Vec<u8> = chunks.concat();
            assert_eq!(rejoined, bytes);
        }
    }
}
