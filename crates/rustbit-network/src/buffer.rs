//! Per-connection byte accumulation.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::error::{NetworkError, NetworkResult};
use crate::wire::Hash256;

/// Append-only byte store shared between a connection's reader task and
/// its decoder.
///
/// The reader task appends at the back; the decoder consumes from the
/// front. Consumed bytes are released and never re-read. [`ByteQueue::read_exact`]
/// blocks the calling thread, which is how a dedicated large-message worker
/// waits out network lulls without spinning.
pub struct ByteQueue {
    inner: Mutex<QueueInner>,
    arrived: Condvar,
}

struct QueueInner {
    buf: BytesMut,
    closed: bool,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buf: BytesMut::new(),
                closed: false,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Append bytes and wake any blocked reader.
    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.buf.extend_from_slice(bytes);
        drop(inner);
        self.arrived.notify_all();
    }

    /// Bytes currently available.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the queue closed and wake blocked readers. Bytes already queued
    /// stay readable; blocking reads that cannot be satisfied fail instead
    /// of waiting forever.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.arrived.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Copy the first `out.len()` bytes without consuming them. Returns
    /// false if fewer bytes are available.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        let inner = self.inner.lock();
        if inner.buf.len() < out.len() {
            return false;
        }
        out.copy_from_slice(&inner.buf[..out.len()]);
        true
    }

    /// Consume and return the first `n` bytes, or `None` if fewer are
    /// available.
    pub fn take(&self, n: usize) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.buf.len() < n {
            return None;
        }
        Some(inner.buf.split_to(n).freeze())
    }

    /// Discard up to `n` bytes from the front. Returns how many were
    /// actually discarded.
    pub fn discard(&self, n: usize) -> usize {
        let mut inner = self.inner.lock();
        let count = n.min(inner.buf.len());
        inner.buf.advance(count);
        count
    }

    /// Block until `out` can be filled, then consume that many bytes.
    ///
    /// `timeout` applies per wait, not to the whole read: any arrival of
    /// new bytes resets the clock, so a slow trickle never starves as long
    /// as each gap stays under the timeout.
    pub fn read_exact(&self, out: &mut [u8], timeout: Duration) -> NetworkResult<()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.buf.len() >= out.len() {
                inner.buf.copy_to_slice(out);
                return Ok(());
            }
            if inner.closed {
                return Err(NetworkError::ConnectionClosed);
            }
            let before = inner.buf.len();
            let result = self.arrived.wait_for(&mut inner, timeout);
            if result.timed_out() && inner.buf.len() == before && !inner.closed {
                return Err(NetworkError::Starved { waited: timeout });
            }
        }
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded, consuming view over a [`ByteQueue`] covering exactly one
/// message body.
///
/// Streaming decoders read through this; a read past the declared body
/// length fails instead of bleeding into the next message's bytes.
pub struct BodyReader<'a> {
    queue: &'a ByteQueue,
    remaining: usize,
    timeout: Duration,
}

impl<'a> BodyReader<'a> {
    pub fn new(queue: &'a ByteQueue, body_len: usize, timeout: Duration) -> Self {
        Self {
            queue,
            remaining: body_len,
            timeout,
        }
    }

    /// Body bytes not yet consumed. Counts declared bytes, not bytes that
    /// have already arrived.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Fill `out` from the body, blocking until enough bytes arrive.
    pub fn read_exact(&mut self, out: &mut [u8]) -> NetworkResult<()> {
        if out.len() > self.remaining {
            return Err(NetworkError::InvalidMessage(format!(
                "read past end of body: asked for {} bytes with {} left",
                out.len(),
                self.remaining
            )));
        }
        self.queue.read_exact(out, self.timeout)?;
        self.remaining -= out.len();
        Ok(())
    }

    /// Consume `n` body bytes into an owned buffer.
    pub fn read_bytes(&mut self, n: usize) -> NetworkResult<Bytes> {
        if n > self.remaining {
            return Err(NetworkError::InvalidMessage(format!(
                "read past end of body: asked for {n} bytes with {} left",
                self.remaining
            )));
        }
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf.into())
    }

    pub fn read_u8(&mut self) -> NetworkResult<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u16_le(&mut self) -> NetworkResult<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32_le(&mut self) -> NetworkResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i32_le(&mut self) -> NetworkResult<i32> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> NetworkResult<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Decode a CompactSize integer from the body.
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
        let mut raw = [0u8; 32];
        self.read_exact(&mut raw)?;
        Ok(Hash256::from_wire_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_peek_take_discard() {
        let queue = ByteQueue::new();
        queue.append(&[1, 2, 3, 4, 5]);

        let mut head = [0u8; 3];
        assert!(queue.peek(&mut head));
        assert_eq!(head, [1, 2, 3]);
        assert_eq!(queue.len(), 5);

        let taken = queue.take(2).unwrap();
        assert_eq!(&taken[..], &[1, 2]);
        assert_eq!(queue.len(), 3);

        assert!(queue.take(4).is_none());
        assert_eq!(queue.discard(10), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_read_exact_waits_for_arrival() {
        let queue = Arc::new(ByteQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.append(&[7, 8, 9, 10]);
        });

        let mut out = [0u8; 4];
        queue
            .read_exact(&mut out, Duration::from_secs(2))
            .unwrap();
        assert_eq!(out, [7, 8, 9, 10]);
        handle.join().unwrap();
    }

    #[test]
    fn test_read_exact_starves_without_data() {
        let queue = ByteQueue::new();
        queue.append(&[1]);
        let mut out = [0u8; 4];
        let err = queue
            .read_exact(&mut out, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, NetworkError::Starved { .. }));
        // The partial byte stays queued for a later retry.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_trickle_resets_timeout() {
        let queue = Arc::new(ByteQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            for byte in 0u8..4 {
                thread::sleep(Duration::from_millis(20));
                producer.append(&[byte]);
            }
        });

        // Each gap is ~20ms, well under the 150ms per-wait timeout, even
        // though the whole read takes longer than a single window.
        let mut out = [0u8; 4];
        queue
            .read_exact(&mut out, Duration::from_millis(150))
            .unwrap();
        assert_eq!(out, [0, 1, 2, 3]);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(ByteQueue::new());
        let closer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            closer.close();
        });

        let mut out = [0u8; 4];
        let err = queue
            .read_exact(&mut out, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionClosed));
        handle.join().unwrap();
    }

    #[test]
    fn test_drained_queue_still_closed() {
        let queue = ByteQueue::new();
        queue.append(&[1, 2]);
        queue.close();

        // Queued bytes remain readable after close.
        let mut out = [0u8; 2];
        queue.read_exact(&mut out, Duration::from_millis(10)).unwrap();
        assert_eq!(out, [1, 2]);

        let err = queue
            .read_exact(&mut out, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionClosed));
    }

    #[test]
    fn test_body_reader_enforces_bound() {
        let queue = ByteQueue::new();
        queue.append(&[0xEF, 0xBE, 0xAD, 0xDE, 0x99, 0x99]);

        let mut body = BodyReader::new(&queue, 4, Duration::from_millis(50));
        assert_eq!(body.read_u32_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(body.remaining(), 0);

        let err = body.read_u8().unwrap_err();
        assert!(matches!(err, NetworkError::InvalidMessage(_)));
        // The trailing bytes belong to the next message and stay queued.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_body_reader_varint() {
        let queue = ByteQueue::new();
        queue.append(&[0xFD, 0x34, 0x12]);
        let mut body = BodyReader::new(&queue, 3, Duration::from_millis(50));
        assert_eq!(body.read_varint().unwrap(), 0x1234);
        assert_eq!(body.remaining(), 0);
    }
}
