//! Message framing for the wire protocol.
//!
//! Every message travels as a fixed 24-byte header followed by the body:
//!
//! ```text
//! +---------+-------------+----------+----------+------------------+
//! |  Magic  |   Command   |  Length  | Checksum |       Body       |
//! | 4 bytes |  12 bytes   | 4 bytes  | 4 bytes  |   Length bytes   |
//! +---------+-------------+----------+----------+------------------+
//! ```
//!
//! - Magic: network identifier, little-endian
//! - Command: ASCII name, NUL-padded to 12 bytes
//! - Length: body length in bytes, little-endian
//! - Checksum: first 4 bytes of SHA256(SHA256(body)); zeroed when the body
//!   is large enough that the receiver streams it instead of buffering

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::Encoder;

use crate::error::{NetworkError, NetworkResult};
use crate::wire::SliceReader;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 24;

/// Size of the NUL-padded command field.
pub const COMMAND_SIZE: usize = 12;

/// First four bytes of the double-SHA256 of `data`.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// A 12-byte NUL-padded ASCII command name.
///
/// Valid names are 1 to 12 printable ASCII bytes; padding NULs appear only
/// after the name. Lookups against the registry are case-insensitive, which
/// [`CommandName::lookup_key`] implements by lowercasing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandName {
    raw: [u8; COMMAND_SIZE],
    len: u8,
}

impl CommandName {
    /// Build a command name from a string.
    pub fn new(name: &str) -> NetworkResult<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > COMMAND_SIZE {
            return Err(NetworkError::InvalidMessage(format!(
                "command name '{name}' must be 1-{COMMAND_SIZE} bytes"
            )));
        }
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(NetworkError::InvalidMessage(format!(
                "command name '{name}' contains non-printable bytes"
            )));
        }
        let mut raw = [0u8; COMMAND_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            raw,
            len: bytes.len() as u8,
        })
    }

    /// Parse the padded wire form.
    pub fn parse(raw: &[u8; COMMAND_SIZE]) -> NetworkResult<Self> {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
        if len == 0 {
            return Err(NetworkError::InvalidMessage(
                "empty command field".to_string(),
            ));
        }
        // Everything after the first NUL must also be NUL.
        if raw[len..].iter().any(|&b| b != 0) {
            return Err(NetworkError::InvalidMessage(
                "command field has bytes after NUL padding".to_string(),
            ));
        }
        if !raw[..len].iter().all(|b| b.is_ascii_graphic()) {
            return Err(NetworkError::InvalidMessage(
                "command field contains non-printable bytes".to_string(),
            ));
        }
        Ok(Self {
            raw: *raw,
            len: len as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees printable ASCII.
        std::str::from_utf8(&self.raw[..self.len as usize]).unwrap_or("")
    }

    /// Lowercased name used as the registry key.
    pub fn lookup_key(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// The full 12-byte padded field.
    pub fn as_padded(&self) -> &[u8; COMMAND_SIZE] {
        &self.raw
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandName({})", self.as_str())
    }
}

/// Parsed 24-byte message header.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: CommandName,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Parse and validate a raw header.
    ///
    /// The magic is checked first so a desynchronized or cross-network peer
    /// fails before any other field is trusted.
    pub fn parse(raw: &[u8; HEADER_SIZE], expected_magic: u32) -> NetworkResult<Self> {
        let mut reader = SliceReader::new(raw);
        let magic = reader.read_u32_le()?;
        if magic != expected_magic {
            return Err(NetworkError::MagicMismatch {
                expected: expected_magic,
                got: magic,
            });
        }
        let mut command_raw = [0u8; COMMAND_SIZE];
        command_raw.copy_from_slice(reader.read_bytes(COMMAND_SIZE)?);
        let command = CommandName::parse(&command_raw)?;
        let length = reader.read_u32_le()?;
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(reader.read_bytes(4)?);
        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }

    /// Append the 24-byte wire form to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.magic);
        dst.put_slice(self.command.as_padded());
        dst.put_u32_le(self.length);
        dst.put_slice(&self.checksum);
    }
}

/// An outbound message: command plus encoded body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: CommandName,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: CommandName, body: Bytes) -> Self {
        Self { command, body }
    }
}

/// Encoder prepending the 24-byte header to each outbound frame.
///
/// Bodies at or above `large_threshold` get a zeroed checksum: the
/// receiving side streams them without buffering, so it could not verify
/// one anyway.
pub struct FrameEncoder {
    magic: u32,
    large_threshold: usize,
}

impl FrameEncoder {
    pub fn new(magic: u32, large_threshold: usize) -> Self {
        Self {
            magic,
            large_threshold,
        }
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = NetworkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> NetworkResult<()> {
        let body_checksum = if frame.body.len() >= self.large_threshold {
            [0u8; 4]
        } else {
            checksum(&frame.body)
        };
        let header = MessageHeader {
            magic: self.magic,
            command: frame.command,
            length: frame.body.len() as u32,
            checksum: body_checksum,
        };
        dst.reserve(HEADER_SIZE + frame.body.len());
        header.write_to(dst);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAINNET_MAGIC;

    #[test]
    fn test_checksum_known_vector() {
        // SHA256d of the empty string, as carried by verack.
        assert_eq!(checksum(&[]), [0x5D, 0xF6, 0xE0, 0xE2]);
    }

    #[test]
    fn test_command_name_padding() {
        let name = CommandName::new("ping").unwrap();
        assert_eq!(name.as_str(), "ping");
        assert_eq!(&name.as_padded()[..5], b"ping\0");
        assert_eq!(name.lookup_key(), "ping");

        let parsed = CommandName::parse(name.as_padded()).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_command_name_rejects_bad_input() {
        assert!(CommandName::new("").is_err());
        assert!(CommandName::new("thirteenchars").is_err());
        assert!(CommandName::new("has space").is_err());

        // NUL in the middle of the field.
        let mut raw = [0u8; COMMAND_SIZE];
        raw[0] = b'p';
        raw[2] = b'g';
        assert!(CommandName::parse(&raw).is_err());
    }

    #[test]
    fn test_lookup_key_lowercases() {
        let name = CommandName::new("PING").unwrap();
        assert_eq!(name.as_str(), "PING");
        assert_eq!(name.lookup_key(), "ping");
    }

    #[test]
    fn test_header_roundtrip() {
        let header = MessageHeader {
            magic: MAINNET_MAGIC,
            command: CommandName::new("inv").unwrap(),
            length: 1000,
            checksum: [1, 2, 3, 4],
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf);
        let parsed = MessageHeader::parse(&raw, MAINNET_MAGIC).unwrap();
        assert_eq!(parsed.command, header.command);
        assert_eq!(parsed.length, 1000);
        assert_eq!(parsed.checksum, [1, 2, 3, 4]);
    }

    #[test]
    fn test_header_magic_mismatch() {
        let header = MessageHeader {
            magic: MAINNET_MAGIC,
            command: CommandName::new("ping").unwrap(),
            length: 8,
            checksum: [0; 4],
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf);

        let err = MessageHeader::parse(&raw, 0x0709_110B).unwrap_err();
        assert!(matches!(err, NetworkError::MagicMismatch { .. }));
    }

    #[test]
    fn test_encoder_small_body_checksummed() {
        let mut encoder = FrameEncoder::new(MAINNET_MAGIC, 1024);
        let body = Bytes::from_static(b"hello");
        let frame = Frame::new(CommandName::new("ping").unwrap(), body.clone());

        let mut dst = BytesMut::new();
        encoder.encode(frame, &mut dst).unwrap();
        assert_eq!(dst.len(), HEADER_SIZE + 5);

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&dst[..HEADER_SIZE]);
        let header = MessageHeader::parse(&raw, MAINNET_MAGIC).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.checksum, checksum(&body));
    }

    #[test]
    fn test_encoder_large_body_zero_checksum() {
        let mut encoder = FrameEncoder::new(MAINNET_MAGIC, 8);
        let frame = Frame::new(
            CommandName::new("block").unwrap(),
            Bytes::from(vec![0xAB; 8]),
        );

        let mut dst = BytesMut::new();
        encoder.encode(frame, &mut dst).unwrap();
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&dst[..HEADER_SIZE]);
        let header = MessageHeader::parse(&raw, MAINNET_MAGIC).unwrap();
        assert_eq!(header.checksum, [0; 4]);
    }
}
