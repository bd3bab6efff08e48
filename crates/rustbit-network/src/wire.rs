//! Wire-format primitives shared by every codec.
//!
//! Multi-byte integers travel little-endian. Lengths and counts use the
//! CompactSize variable-length encoding: values below 0xFD occupy a single
//! byte, larger values carry a marker byte (0xFD, 0xFE or 0xFF) followed by
//! a 16-, 32- or 64-bit little-endian integer. 32-byte hashes travel in
//! reversed byte order relative to their display form.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Encode a CompactSize integer into `buf`.
pub fn write_varint(buf: &mut BytesMut, value: u64) {
    if value < 0xFD {
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(0xFD);
        buf.put_u16_le(value as u16);
    } else if value <= 0xFFFF_FFFF {
        buf.put_u8(0xFE);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xFF);
        buf.put_u64_le(value);
    }
}

/// Encoded length of a CompactSize integer.
pub fn varint_len(value: u64) -> usize {
    if value < 0xFD {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// A 32-byte hash, stored in wire order.
///
/// Wire order is byte-reversed relative to the conventional display form,
/// so `Display` reverses before hex-encoding and [`Hash256::from_display_hex`]
/// reverses after decoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub const LEN: usize = 32;

    /// Wrap bytes already in wire order.
    pub fn from_wire_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the conventional big-endian hex form.
    pub fn from_display_hex(s: &str) -> NetworkResult<Self> {
        let raw = hex::decode(s)
            .map_err(|e| NetworkError::InvalidMessage(format!("bad hash hex: {e}")))?;
        if raw.len() != Self::LEN {
            return Err(NetworkError::InvalidMessage(format!(
                "hash hex is {} bytes, expected {}",
                raw.len(),
                Self::LEN
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        bytes.reverse();
        Ok(Self(bytes))
    }

    /// Bytes in wire order.
    pub fn as_wire_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Append the wire-order bytes to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut display = self.0;
        display.reverse();
        write!(f, "{}", hex::encode(display))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

/// Checked cursor over a byte slice.
///
/// Every read validates the remaining length first, so codecs never index
/// out of bounds on truncated input.
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Take the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> NetworkResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(NetworkError::InvalidMessage(format!(
                "truncated field: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> NetworkResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> NetworkResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> NetworkResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_le(&mut self) -> NetworkResult<i32> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> NetworkResult<u64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Decode a CompactSize integer.
    ///
    /// Non-minimal encodings are accepted and read back exactly as written.
    pub fn read_varint(&mut self) -> NetworkResult<u64> {
        let marker = self.read_u8()?;
        match marker {
            0xFD => Ok(u64::from(self.read_u16_le()?)),
            0xFE => Ok(u64::from(self.read_u32_le()?)),
            0xFF => self.read_u64_le(),
            direct => Ok(u64::from(direct)),
        }
    }

    pub fn read_hash(&mut self) -> NetworkResult<Hash256> {
        let b = self.read_bytes(Hash256::LEN)?;
        let mut raw = [0u8; 32];
        raw.copy_from_slice(b);
        Ok(Hash256::from_wire_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> (u64, usize) {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, value);
        assert_eq!(buf.len(), varint_len(value));
        let mut reader = SliceReader::new(&buf);
        let decoded = reader.read_varint().unwrap();
        (decoded, reader.consumed())
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, expected_len) in [
            (0u64, 1usize),
            (252, 1),
            (253, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ] {
            let (decoded, used) = roundtrip(value);
            assert_eq!(decoded, value);
            assert_eq!(used, expected_len);
        }
    }

    #[test]
    fn test_varint_truncated() {
        // Marker promises a u16 but only one byte follows.
        let mut reader = SliceReader::new(&[0xFD, 0x01]);
        assert!(reader.read_varint().is_err());

        let mut reader = SliceReader::new(&[0xFF, 0, 0, 0]);
        assert!(reader.read_varint().is_err());
    }

    #[test]
    fn test_varint_non_minimal() {
        // 1 encoded with the 0xFD marker is non-minimal but still readable.
        let mut reader = SliceReader::new(&[0xFD, 0x01, 0x00]);
        assert_eq!(reader.read_varint().unwrap(), 1);
        assert_eq!(reader.consumed(), 3);
    }

    #[test]
    fn test_hash_display_reverses() {
        let mut wire = [0u8; 32];
        wire[0] = 0xAA;
        wire[31] = 0x11;
        let hash = Hash256::from_wire_bytes(wire);
        let text = hash.to_string();
        assert!(text.starts_with("11"));
        assert!(text.ends_with("aa"));

        let parsed = Hash256::from_display_hex(&text).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_hash_rejects_short_hex() {
        assert!(Hash256::from_display_hex("abcd").is_err());
    }

    #[test]
    fn test_slice_reader_bounds() {
        let data = [1u8, 2, 3];
        let mut reader = SliceReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.remaining(), 2);
        assert!(reader.read_u32_le().is_err());
        // Failed read consumes nothing.
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.read_u16_le().unwrap(), 0x0302);
    }
}
