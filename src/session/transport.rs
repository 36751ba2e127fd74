//! Transport adapter contract
//!
//! A session never owns a socket; it only needs something that moves raw
//! bytes without blocking. `TransportAdapter` is that capability.
//!
//! Contract:
//! - `write` never reports more bytes than it was given and returns
//!   `WouldBlock` (not `Failed`) when the send side is full.
//! - `read` returns `WouldBlock` (not a zero-byte success) when nothing is
//!   available, and never reports more than the destination capacity.
//!   `Success` with zero bytes means end of stream.

use super::SessionResult;
use std::io::{self, Read, Write};

/// Non-blocking byte I/O a session calls back into
pub trait TransportAdapter {
    /// Write bytes, returning the outcome and the number of bytes accepted
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize);

    /// Read bytes, returning the outcome and the number of bytes stored
    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize);
}

impl<T: TransportAdapter + ?Sized> TransportAdapter for &mut T {
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        (**self).read(buf)
    }
}

impl<T: TransportAdapter + ?Sized> TransportAdapter for Box<T> {
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        (**self).read(buf)
    }
}

/// Classify an I/O error as retryable or fatal
pub(crate) fn classify(err: &io::Error) -> SessionResult {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SessionResult::WouldBlock,
        _ => SessionResult::Failed,
    }
}

/// Map a raw `read` result onto the transport contract
pub(crate) fn map_read(result: &io::Result<usize>, capacity: usize) -> (SessionResult, usize) {
    match result {
        Ok(n) => (SessionResult::Success, (*n).min(capacity)),
        Err(e) => (classify(e), 0),
    }
}

/// Map a raw `write` result onto the transport contract
pub(crate) fn map_write(result: &io::Result<usize>, len: usize) -> (SessionResult, usize) {
    match result {
        Ok(0) if len > 0 => (SessionResult::WouldBlock, 0),
        Ok(n) => (SessionResult::Success, (*n).min(len)),
        Err(e) => (classify(e), 0),
    }
}

/// Transport over any non-blocking `Read + Write` stream
///
/// The stream must already be in non-blocking mode; `WouldBlock` errors are
/// passed through as [`SessionResult::WouldBlock`].
pub struct IoTransport<S> {
    inner: S,
    last_error: Option<io::Error>,
}

impl<S: Read + Write> IoTransport<S> {
    pub fn new(inner: S) -> Self {
        IoTransport {
            inner,
            last_error: None,
        }
    }

    /// Last fatal I/O error seen by this transport
    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn record(&mut self, result: io::Result<usize>, mapped: (SessionResult, usize)) -> (SessionResult, usize) {
        if let Err(e) = result {
            if mapped.0.is_failed() {
                log::warn!("transport I/O failed: {}", e);
                self.last_error = Some(e);
            }
        }
        mapped
    }
}

impl<S: Read + Write> TransportAdapter for IoTransport<S> {
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        let result = self.inner.write(buf);
        let mapped = map_write(&result, buf.len());
        self.record(result, mapped)
    }

    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        let result = self.inner.read(buf);
        let mapped = map_read(&result, buf.len());
        self.record(result, mapped)
    }
}
