//! In-memory loopback transport
//!
//! `MemoryPipe::pair()` returns two connected [`PipeEnd`]s: bytes written to
//! one end become readable at the other. Each end can be throttled, limited
//! to small reads, paused, broken or closed, which makes it the transport of
//! choice for driving two sessions against each other in tests and
//! benchmarks without sockets or threads.

use super::{SessionResult, TransportAdapter};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Debug, Default)]
struct Direction {
    data: VecDeque<u8>,
    capacity: Option<usize>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    /// Written by the first end, read by the second
    forward: Direction,
    /// Written by the second end, read by the first
    backward: Direction,
    broken: bool,
}

/// Factory for connected in-memory transports
pub struct MemoryPipe;

impl MemoryPipe {
    /// Create two connected, unthrottled ends
    pub fn pair() -> (PipeEnd, PipeEnd) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let first = PipeEnd::new(shared.clone(), true);
        let second = PipeEnd::new(shared, false);
        (first, second)
    }
}

/// One end of a [`MemoryPipe`]
#[derive(Debug)]
pub struct PipeEnd {
    shared: Rc<RefCell<Shared>>,
    first: bool,
    max_read: Option<usize>,
    paused: bool,
    read_calls: usize,
    write_calls: usize,
}

impl PipeEnd {
    fn new(shared: Rc<RefCell<Shared>>, first: bool) -> Self {
        PipeEnd {
            shared,
            first,
            max_read: None,
            paused: false,
            read_calls: 0,
            write_calls: 0,
        }
    }

    fn with_outbound<R>(&self, f: impl FnOnce(&mut Direction) -> R) -> R {
        let mut shared = self.shared.borrow_mut();
        if self.first {
            f(&mut shared.forward)
        } else {
            f(&mut shared.backward)
        }
    }

    fn with_inbound<R>(&self, f: impl FnOnce(&mut Direction) -> R) -> R {
        let mut shared = self.shared.borrow_mut();
        if self.first {
            f(&mut shared.backward)
        } else {
            f(&mut shared.forward)
        }
    }

    /// Limit how many bytes may sit unread in the outbound direction
    pub fn set_write_capacity(&mut self, capacity: Option<usize>) {
        self.with_outbound(|d| d.capacity = capacity);
    }

    /// Limit how many bytes a single `read` on this end returns
    pub fn set_max_read(&mut self, max_read: Option<usize>) {
        self.max_read = max_read;
    }

    /// While paused, `read` reports `WouldBlock` even if data is queued
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Make every subsequent operation on both ends fail
    pub fn break_pipe(&mut self) {
        self.shared.borrow_mut().broken = true;
    }

    /// Close the outbound direction; the peer reads end of stream once drained
    pub fn close_write(&mut self) {
        self.with_outbound(|d| d.closed = true);
    }

    /// Bytes waiting to be read by this end
    pub fn pending(&self) -> usize {
        self.with_inbound(|d| d.data.len())
    }

    /// Bytes written by this end and not yet read by the peer
    pub fn unread(&self) -> usize {
        self.with_outbound(|d| d.data.len())
    }

    /// Remove and return everything queued toward this end
    pub fn take_inbound(&mut self) -> Vec<u8> {
        self.with_inbound(|d| d.data.drain(..).collect())
    }

    /// Queue raw bytes toward this end, bypassing the peer
    pub fn inject(&mut self, bytes: &[u8]) {
        self.with_inbound(|d| d.data.extend(bytes.iter().copied()));
    }

    /// Number of `read` calls made on this end
    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    /// Number of `write` calls made on this end
    pub fn write_calls(&self) -> usize {
        self.write_calls
    }
}

impl TransportAdapter for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        self.write_calls += 1;
        if self.shared.borrow().broken {
            return (SessionResult::Failed, 0);
        }

        self.with_outbound(|d| {
            if d.closed {
                return (SessionResult::Failed, 0);
            }
            let room = match d.capacity {
                Some(cap) => cap.saturating_sub(d.data.len()),
                None => buf.len(),
            };
            let n = room.min(buf.len());
            if n == 0 && !buf.is_empty() {
                return (SessionResult::WouldBlock, 0);
            }
            d.data.extend(buf[..n].iter().copied());
            (SessionResult::Success, n)
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        self.read_calls += 1;
        if self.shared.borrow().broken {
            return (SessionResult::Failed, 0);
        }
        if self.paused {
            return (SessionResult::WouldBlock, 0);
        }

        let limit = self.max_read.unwrap_or(usize::MAX).min(buf.len());
        self.with_inbound(|d| {
            if d.data.is_empty() {
                return if d.closed {
                    (SessionResult::Success, 0)
                } else {
                    (SessionResult::WouldBlock, 0)
                };
            }
            let n = limit.min(d.data.len());
            for (slot, byte) in buf[..n].iter_mut().zip(d.data.drain(..n)) {
                *slot = byte;
            }
            (SessionResult::Success, n)
        })
    }
}
