//! Receive-side stream buffer
//!
//! Accumulates raw socket bytes until whole frames are available. Consumed
//! bytes are released from the front, so the unread region always starts
//! at offset zero and the storage is reused across reads.

use std::fmt;

use bytes::{Buf, BytesMut};

/// Growable receive buffer with a hard size limit
pub struct CircleStreamBuffer {
    buf: BytesMut,
    limit: usize,
}

impl fmt::Debug for CircleStreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircleStreamBuffer")
            .field("unread", &self.buf.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl CircleStreamBuffer {
    /// Create a buffer holding at most `limit` unread bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// Append bytes; returns false (and writes nothing) past the limit
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.buf.len() + data.len() > self.limit {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// Bytes written but not yet consumed
    #[inline]
    pub fn unread_size(&self) -> usize {
        self.buf.len()
    }

    /// The unread region
    #[inline]
    pub fn read_buf(&self) -> &[u8] {
        &self.buf
    }

    /// Consume `n` bytes; false if fewer are unread
    pub fn seek_read_pos(&mut self, n: usize) -> bool {
        if n > self.buf.len() {
            return false;
        }
        self.buf.advance(n);
        true
    }

    /// Drop every unread byte
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
