//! Record-buffering session engine
//!
//! `RecordSession` is used when the TLS backend only offers primitive
//! operations (negotiate a step, encrypt a record, decrypt a record) and
//! leaves framing, buffering and I/O to the caller. The engine keeps three
//! queues per connection:
//!
//! - `from_wire`: ciphertext read from the transport and not yet consumed
//! - `to_wire`: ciphertext waiting to be written to the transport
//! - `for_client`: plaintext waiting to be handed to the caller
//!
//! `from_wire` only grows by appending transport reads and only shrinks by
//! what one provider step reports as consumed; trailing "extra" bytes stay
//! in place for the next step.
//!
//! When a step needs more ciphertext than is buffered, the engine records
//! the queue's version tag. Until a later read actually appends bytes, the
//! provider is not called again, so retrying on an idle transport has no
//! side effects.

pub mod provider;
pub mod ssl_provider;

pub use provider::{
    DecryptStatus, NegotiateStatus, ProviderError, SecurityProvider, Step as ProviderStep,
    StreamSizes,
};
pub use ssl_provider::OpensslProvider;

use crate::buffer::StreamBuffer;
use crate::session::{
    Error, Result, Session, SessionLimits, SessionResult, SessionState, Step, TransportAdapter,
};

/// Counters describing what a session has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub transport_reads: u64,
    pub transport_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub records_encrypted: u64,
    pub records_decrypted: u64,
    /// Provider steps that left trailing bytes of a later record buffered
    pub extra_retained: u64,
    pub renegotiations: u64,
}

enum ReadOutcome {
    Data,
    WouldBlock,
    Eof,
    Failed,
}

/// TLS session that frames records itself on top of a [`SecurityProvider`]
pub struct RecordSession<P, T> {
    provider: P,
    transport: Option<T>,
    peer_name: Option<String>,
    state: SessionState,
    limits: SessionLimits,
    from_wire: StreamBuffer,
    to_wire: StreamBuffer,
    for_client: StreamBuffer,
    scratch: Vec<u8>,
    sizes: Option<StreamSizes>,
    renegotiate_pending: bool,
    incomplete_mark: Option<u64>,
    shutdown_sent: bool,
    peer_closed: bool,
    stats: SessionStats,
    last_error: Option<Error>,
}

impl<P: SecurityProvider, T: TransportAdapter> RecordSession<P, T> {
    /// Create a session with default buffering limits
    pub fn new(provider: P) -> Self {
        Self::with_limits(provider, SessionLimits::default())
    }

    /// Create a session with explicit buffering limits
    pub fn with_limits(provider: P, limits: SessionLimits) -> Self {
        let limits = SessionLimits {
            max_buffered: limits.max_buffered.max(1),
            read_chunk: limits.read_chunk.max(1),
        };
        RecordSession {
            provider,
            transport: None,
            peer_name: None,
            state: SessionState::Uninitialized,
            limits,
            from_wire: StreamBuffer::new(),
            to_wire: StreamBuffer::new(),
            for_client: StreamBuffer::new(),
            scratch: vec![0u8; limits.read_chunk],
            sizes: None,
            renegotiate_pending: false,
            incomplete_mark: None,
            shutdown_sent: false,
            peer_closed: false,
            stats: SessionStats::default(),
            last_error: None,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Ciphertext queued for the transport
    pub fn pending_output(&self) -> usize {
        self.to_wire.len()
    }

    /// Ciphertext read from the transport and not yet consumed
    pub fn pending_input(&self) -> usize {
        self.from_wire.len()
    }

    /// Plaintext decrypted and not yet delivered
    pub fn pending_plaintext(&self) -> usize {
        self.for_client.len()
    }

    fn fail(&mut self, err: Error) -> Step {
        log::error!("TLS session failed: {}", err);
        self.state = SessionState::Failed;
        self.last_error = Some(err);
        Step::Failed
    }

    fn is_still_incomplete(&self) -> bool {
        self.incomplete_mark == Some(self.from_wire.version())
    }

    fn capture_incomplete(&mut self, incomplete: bool) {
        self.incomplete_mark = if incomplete {
            Some(self.from_wire.version())
        } else {
            None
        };
    }

    fn retain_extra(&mut self, extra: usize) {
        self.from_wire.retain_tail(extra);
        if extra > 0 {
            self.stats.extra_retained += 1;
            log::trace!("{} bytes left for the next record", extra);
        }
    }

    /// One transport write of whatever ciphertext is queued
    fn flush_write(&mut self) -> Step {
        if self.to_wire.is_empty() {
            return Step::Success;
        }
        let Some(transport) = self.transport.as_mut() else {
            return self.fail(Error::NoTransport);
        };

        let (result, written) = transport.write(self.to_wire.as_slice());
        self.stats.transport_writes += 1;
        match result {
            SessionResult::Success => {
                self.to_wire.consume(written);
                self.stats.bytes_written += written as u64;
                log::trace!("==> {} bytes written to wire", written);
                if self.to_wire.is_empty() {
                    Step::Success
                } else {
                    Step::WouldBlock
                }
            }
            SessionResult::WouldBlock => Step::WouldBlock,
            SessionResult::Failed => self.fail(Error::Transport("write failed".to_string())),
        }
    }

    /// One transport read into `from_wire`
    fn read_once(&mut self) -> ReadOutcome {
        let room = self.limits.max_buffered.saturating_sub(self.from_wire.len());
        if room == 0 {
            return ReadOutcome::WouldBlock;
        }
        let Some(transport) = self.transport.as_mut() else {
            self.fail(Error::NoTransport);
            return ReadOutcome::Failed;
        };

        let want = room.min(self.scratch.len());
        let (result, read) = transport.read(&mut self.scratch[..want]);
        self.stats.transport_reads += 1;
        match result {
            SessionResult::Success if read > 0 => {
                let read = read.min(want);
                self.from_wire.write(&self.scratch[..read]);
                self.stats.bytes_read += read as u64;
                log::trace!("<== {} bytes read from wire", read);
                ReadOutcome::Data
            }
            SessionResult::Success => ReadOutcome::Eof,
            SessionResult::WouldBlock => ReadOutcome::WouldBlock,
            SessionResult::Failed => {
                self.fail(Error::Transport("read failed".to_string()));
                ReadOutcome::Failed
            }
        }
    }

    fn handshake_step(&mut self) -> Step {
        match self.state {
            SessionState::Failed | SessionState::Closed | SessionState::Closing => {
                return Step::Failed;
            }
            SessionState::Established if !self.renegotiate_pending => {
                return match self.flush_write() {
                    Step::Failed => Step::Failed,
                    _ if self.to_wire.is_empty() => Step::Success,
                    _ => Step::WouldBlock,
                };
            }
            SessionState::Uninitialized => {
                if self.transport.is_none() {
                    return self.fail(Error::NoTransport);
                }
                log::debug!("starting handshake (peer {:?})", self.peer_name);
                self.state = SessionState::Handshaking;
            }
            _ => {}
        }

        // Bytes left over from the previous step are processed before the
        // transport is touched again.
        let has_unprocessed = !self.from_wire.is_empty() && !self.is_still_incomplete();
        if !has_unprocessed {
            match self.read_once() {
                ReadOutcome::Failed => return Step::Failed,
                ReadOutcome::Eof => return self.fail(Error::UnexpectedEof),
                ReadOutcome::Data | ReadOutcome::WouldBlock => {}
            }
        }

        let result;
        loop {
            if self.is_still_incomplete() {
                result = Step::IncompleteRecord;
                break;
            }

            let input_len = self.from_wire.len();
            let output_before = self.to_wire.len();
            let step = match self
                .provider
                .negotiate(self.from_wire.as_slice(), &mut self.to_wire)
            {
                Ok(step) => step,
                Err(e) => return self.fail(e.into()),
            };

            match step.status {
                NegotiateStatus::IncompleteMessage => {
                    self.capture_incomplete(true);
                    result = Step::IncompleteRecord;
                    break;
                }
                NegotiateStatus::ContinueNeeded => {
                    let consumed = step.consumed(input_len);
                    self.retain_extra(step.extra);
                    let stalled = consumed == 0 && self.to_wire.len() == output_before;
                    self.capture_incomplete(stalled);
                    if stalled {
                        result = Step::IncompleteRecord;
                        break;
                    }
                    if self.from_wire.is_empty() {
                        result = Step::WouldBlock;
                        break;
                    }
                }
                NegotiateStatus::Complete => {
                    self.retain_extra(step.extra);
                    self.capture_incomplete(false);
                    self.state = SessionState::Established;
                    self.renegotiate_pending = false;
                    self.sizes = None;
                    log::debug!("handshake complete (peer {:?})", self.peer_name);
                    result = Step::Success;
                    break;
                }
            }
        }

        if self.flush_write() == Step::Failed {
            return Step::Failed;
        }
        match result {
            Step::Success if !self.to_wire.is_empty() => Step::WouldBlock,
            other => other,
        }
    }

    fn stream_sizes(&mut self) -> std::result::Result<StreamSizes, ProviderError> {
        if let Some(sizes) = self.sizes {
            return Ok(sizes);
        }
        let sizes = self.provider.stream_sizes()?;
        if sizes.max_message == 0 {
            return Err(ProviderError::Encrypt(
                "provider reported a zero maximum message size".to_string(),
            ));
        }
        log::debug!(
            "record layout: header {} trailer {} max message {}",
            sizes.header,
            sizes.trailer,
            sizes.max_message
        );
        self.sizes = Some(sizes);
        Ok(sizes)
    }

    /// Encrypt one chunk of at most `max_message` bytes into `to_wire`
    fn encrypt_chunk(
        &mut self,
        chunk: &[u8],
        sizes: StreamSizes,
    ) -> std::result::Result<(), ProviderError> {
        let len = chunk.len();
        let provider = &mut self.provider;
        let fill = |record: &mut [u8]| -> std::result::Result<usize, ProviderError> {
            record[sizes.header..sizes.header + len].copy_from_slice(chunk);
            let trailer = provider.encrypt(record, &sizes, len)?;
            if trailer > sizes.trailer {
                return Err(ProviderError::BufferTooSmall {
                    needed: sizes.header + len + trailer,
                });
            }
            // The realized trailer may be shorter than the reserved one.
            Ok(sizes.header + len + trailer)
        };
        self.to_wire.append_with(sizes.record_len(len), fill)?;
        self.stats.records_encrypted += 1;
        Ok(())
    }

    fn deliver(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        let n = self.for_client.read(buf);
        (SessionResult::Success, n)
    }

    /// Decrypt every complete record already buffered
    ///
    /// Returns `Some` when the caller must return immediately.
    fn drain_records(&mut self) -> Option<Step> {
        while !self.from_wire.is_empty() && !self.is_still_incomplete() && !self.peer_closed {
            let input_len = self.from_wire.len();
            let step = match self
                .provider
                .decrypt(self.from_wire.as_slice(), &mut self.for_client)
            {
                Ok(step) => step,
                Err(e) => return Some(self.fail(e.into())),
            };

            match step.status {
                DecryptStatus::IncompleteMessage => self.capture_incomplete(true),
                DecryptStatus::Ok => {
                    let consumed = step.consumed(input_len);
                    self.retain_extra(step.extra);
                    self.stats.records_decrypted += 1;
                    self.capture_incomplete(consumed == 0);
                }
                DecryptStatus::Renegotiate => {
                    self.retain_extra(step.extra);
                    self.capture_incomplete(false);
                    self.renegotiate_pending = true;
                    self.state = SessionState::Handshaking;
                    self.sizes = None;
                    self.stats.renegotiations += 1;
                    log::debug!("TLS renegotiation requested by peer");
                    return Some(Step::RenegotiationRequested);
                }
                DecryptStatus::ContextExpired => {
                    self.retain_extra(step.extra);
                    self.capture_incomplete(false);
                    self.peer_closed = true;
                    log::debug!("peer closed the TLS session");
                }
            }
        }
        None
    }
}

impl<P: SecurityProvider, T: TransportAdapter> Session for RecordSession<P, T> {
    type Transport = T;

    fn set_peer_name(&mut self, name: &str) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(Error::HandshakeStarted);
        }
        self.provider.set_peer_name(name)?;
        self.peer_name = Some(name.to_string());
        Ok(())
    }

    fn set_transport(&mut self, transport: T) -> Result<()> {
        if self.transport.is_some() {
            return Err(Error::TransportAlreadyBound);
        }
        self.transport = Some(transport);
        Ok(())
    }

    fn handshake(&mut self) -> SessionResult {
        self.handshake_step().public()
    }

    fn send(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        if matches!(
            self.state,
            SessionState::Failed | SessionState::Closed | SessionState::Closing
        ) {
            return (SessionResult::Failed, 0);
        }

        if self.state != SessionState::Established || self.renegotiate_pending {
            // Ciphertext accepted before the renegotiation goes out first.
            if self.renegotiate_pending && !self.to_wire.is_empty() {
                match self.flush_write() {
                    Step::Failed => return (SessionResult::Failed, 0),
                    _ if !self.to_wire.is_empty() => return (SessionResult::WouldBlock, 0),
                    _ => {}
                }
            }
            // Success here means the final token is already on the wire.
            match self.handshake_step() {
                Step::Failed => return (SessionResult::Failed, 0),
                Step::Success => {}
                _ => return (SessionResult::WouldBlock, 0),
            }
        }

        // Set once a write in this call left ciphertext queued.
        let mut blocked = false;
        if self.to_wire.len() >= self.limits.max_buffered {
            match self.flush_write() {
                Step::Failed => return (SessionResult::Failed, 0),
                _ if self.to_wire.len() >= self.limits.max_buffered => {
                    return (SessionResult::WouldBlock, 0);
                }
                _ => blocked = !self.to_wire.is_empty(),
            }
        }

        if buf.is_empty() {
            return (SessionResult::Success, 0);
        }

        let sizes = match self.stream_sizes() {
            Ok(sizes) => sizes,
            Err(e) => return (self.fail(e.into()).public(), 0),
        };

        let mut consumed = 0;
        while consumed < buf.len() && self.to_wire.len() < self.limits.max_buffered {
            let n = (buf.len() - consumed).min(sizes.max_message);
            if let Err(e) = self.encrypt_chunk(&buf[consumed..consumed + n], sizes) {
                return (self.fail(e.into()).public(), 0);
            }
            consumed += n;
        }

        if !blocked && self.flush_write() == Step::Failed {
            return (SessionResult::Failed, 0);
        }
        (SessionResult::Success, consumed)
    }

    fn receive(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        if matches!(
            self.state,
            SessionState::Failed | SessionState::Closed | SessionState::Closing
        ) {
            return (SessionResult::Failed, 0);
        }
        if buf.is_empty() {
            return (SessionResult::Success, 0);
        }

        // Plaintext decrypted earlier is handed out before anything else.
        if !self.for_client.is_empty() {
            return self.deliver(buf);
        }
        if self.peer_closed {
            return (SessionResult::Success, 0);
        }

        let mut read_done = false;
        if self.state != SessionState::Established || self.renegotiate_pending {
            match self.handshake_step() {
                Step::Failed => return (SessionResult::Failed, 0),
                Step::Success => read_done = true,
                _ => return (SessionResult::WouldBlock, 0),
            }
        } else if self.flush_write() == Step::Failed {
            return (SessionResult::Failed, 0);
        }

        loop {
            match self.drain_records() {
                Some(Step::Failed) => return (SessionResult::Failed, 0),
                Some(step) => {
                    let (_, n) = self.deliver(buf);
                    return (step.public(), n);
                }
                None => {}
            }

            if !self.for_client.is_empty() {
                return self.deliver(buf);
            }
            if self.peer_closed || read_done {
                break;
            }

            read_done = true;
            match self.read_once() {
                ReadOutcome::Data => {}
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    log::debug!("transport reached end of stream");
                    self.peer_closed = true;
                }
                ReadOutcome::Failed => return (SessionResult::Failed, 0),
            }
        }

        if self.peer_closed {
            (SessionResult::Success, 0)
        } else {
            (SessionResult::WouldBlock, 0)
        }
    }

    fn close(&mut self) -> SessionResult {
        match self.state {
            SessionState::Closed => return SessionResult::Success,
            SessionState::Failed => return SessionResult::Failed,
            SessionState::Uninitialized => {
                self.state = SessionState::Closed;
                return SessionResult::Success;
            }
            SessionState::Handshaking | SessionState::Established | SessionState::Closing => {}
        }

        if !self.shutdown_sent {
            if let Err(e) = self.provider.shutdown(&mut self.to_wire) {
                return self.fail(e.into()).public();
            }
            self.shutdown_sent = true;
            self.state = SessionState::Closing;
            log::debug!("TLS shutdown token queued");
        }

        match self.flush_write() {
            Step::Failed => {
                self.to_wire.clear();
                SessionResult::Failed
            }
            _ if self.to_wire.is_empty() => {
                self.state = SessionState::Closed;
                SessionResult::Success
            }
            _ => SessionResult::WouldBlock,
        }
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}
