//! Byte FIFO used for ciphertext and plaintext queues
//!
//! `StreamBuffer` is a growable queue: bytes are appended at the back and
//! consumed from the front. Every append bumps a version tag so callers can
//! tell whether new data arrived since they last looked.

use bytes::{Buf, BytesMut};

/// Growable byte queue with a change counter
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: BytesMut,
    version: u64,
}

impl StreamBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        StreamBuffer {
            data: BytesMut::with_capacity(capacity),
            version: 0,
        }
    }

    /// Number of bytes queued
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Peek at all queued bytes without consuming them
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Version tag, bumped on every append
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Append bytes to the back of the queue
    pub fn write(&mut self, src: &[u8]) -> usize {
        if !src.is_empty() {
            self.data.extend_from_slice(src);
            self.version += 1;
        }
        src.len()
    }

    /// Copy bytes from the front into `dst` and consume them
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        if n > 0 {
            dst[..n].copy_from_slice(&self.data[..n]);
            self.data.advance(n);
        }
        n
    }

    /// Drop `n` bytes from the front
    ///
    /// Consuming more than is queued empties the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Drop `n` bytes from the front so that exactly `keep` trailing bytes remain
    pub fn retain_tail(&mut self, keep: usize) {
        let keep = keep.min(self.data.len());
        self.consume(self.data.len() - keep);
    }

    /// Reserve `max` zeroed bytes at the back and let `fill` write into them
    ///
    /// `fill` returns how many of the reserved bytes are valid; the rest is
    /// released again. On error nothing is appended.
    pub fn append_with<E, F>(&mut self, max: usize, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        let start = self.data.len();
        self.data.resize(start + max, 0);
        match fill(&mut self.data[start..]) {
            Ok(used) => {
                let used = used.min(max);
                self.data.truncate(start + used);
                if used > 0 {
                    self.version += 1;
                }
                Ok(used)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Discard everything queued
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
