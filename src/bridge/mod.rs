//! Bridged session adapter
//!
//! Some TLS engines live on the far side of a runtime boundary (a managed
//! VM, a sandbox, an FFI layer) and cannot borrow the caller's buffers.
//! They are reached through a narrow callback interface: the engine asks
//! [`BridgeIo`] for raw bytes and hands plaintext back by value.
//!
//! [`BridgedSession`] adapts such a [`ManagedEngine`] to [`Session`]. All
//! ciphertext crosses the boundary through a fixed-size bridge buffer, and
//! plaintext the engine returns beyond the caller's capacity is kept and
//! replayed on the next `receive` before the engine is asked for more.

use crate::buffer::StreamBuffer;
use crate::session::{
    Error, Result, Session, SessionResult, SessionState, Step, TransportAdapter,
};

/// Size of the buffer bytes are copied through in each direction
pub const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// Status codes crossing the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Ok,
    WouldBlock,
    /// End of stream or peer shutdown
    Closed,
    /// Engine-specific failure code
    Error(i32),
}

/// Raw byte I/O offered to the engine
pub trait BridgeIo {
    fn read(&mut self, buf: &mut [u8]) -> (BridgeStatus, usize);
    fn write(&mut self, buf: &[u8]) -> (BridgeStatus, usize);
}

/// TLS engine reached through a bridge
///
/// Every call may perform any number of `io` operations and must return
/// `WouldBlock` when it cannot progress without more I/O.
pub trait ManagedEngine {
    fn set_peer_name(&mut self, name: &str) -> BridgeStatus;

    fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus;

    /// Encrypt and send `data`, returning how many bytes were accepted
    fn write(&mut self, io: &mut dyn BridgeIo, data: &[u8]) -> (BridgeStatus, usize);

    /// Append decrypted bytes to `out`
    ///
    /// `hint` is the caller's capacity; the engine may append more.
    fn read(&mut self, io: &mut dyn BridgeIo, out: &mut Vec<u8>, hint: usize) -> BridgeStatus;

    fn close(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus;
}

impl<E: ManagedEngine + ?Sized> ManagedEngine for Box<E> {
    fn set_peer_name(&mut self, name: &str) -> BridgeStatus {
        (**self).set_peer_name(name)
    }

    fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        (**self).handshake(io)
    }

    fn write(&mut self, io: &mut dyn BridgeIo, data: &[u8]) -> (BridgeStatus, usize) {
        (**self).write(io, data)
    }

    fn read(&mut self, io: &mut dyn BridgeIo, out: &mut Vec<u8>, hint: usize) -> BridgeStatus {
        (**self).read(io, out, hint)
    }

    fn close(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
        (**self).close(io)
    }
}

/// [`BridgeIo`] over a [`TransportAdapter`], copying through the bridge buffer
///
/// Remembers the outcome of the last transport call made during the current
/// engine call, so a `WouldBlock` the engine saw can be reported faithfully
/// even if the engine turned it into an error.
pub struct TransportBridge<T> {
    transport: T,
    buffer: Vec<u8>,
    last: Option<SessionResult>,
}

impl<T: TransportAdapter> TransportBridge<T> {
    fn new(transport: T) -> Self {
        TransportBridge {
            transport,
            buffer: vec![0u8; BRIDGE_BUFFER_SIZE],
            last: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Outcome of the most recent transport call in the current engine call
    ///
    /// `None` when the engine has not touched the transport since
    /// [`TransportBridge::begin_call`].
    pub fn last_result(&self) -> Option<SessionResult> {
        self.last
    }

    /// Forget the outcome of earlier engine calls
    fn begin_call(&mut self) -> &mut Self {
        self.last = None;
        self
    }
}

impl<T: TransportAdapter> BridgeIo for TransportBridge<T> {
    fn read(&mut self, buf: &mut [u8]) -> (BridgeStatus, usize) {
        let want = buf.len().min(self.buffer.len());
        let (result, n) = self.transport.read(&mut self.buffer[..want]);
        self.last = Some(result);
        match result {
            SessionResult::Success if n == 0 && want > 0 => (BridgeStatus::Closed, 0),
            SessionResult::Success => {
                let n = n.min(want);
                buf[..n].copy_from_slice(&self.buffer[..n]);
                (BridgeStatus::Ok, n)
            }
            SessionResult::WouldBlock => (BridgeStatus::WouldBlock, 0),
            SessionResult::Failed => (BridgeStatus::Error(-1), 0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> (BridgeStatus, usize) {
        let len = buf.len().min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&buf[..len]);
        let (result, n) = self.transport.write(&self.buffer[..len]);
        self.last = Some(result);
        match result {
            SessionResult::Success => (BridgeStatus::Ok, n.min(len)),
            SessionResult::WouldBlock => (BridgeStatus::WouldBlock, 0),
            SessionResult::Failed => (BridgeStatus::Error(-1), 0),
        }
    }
}

/// [`Session`] over a [`ManagedEngine`]
pub struct BridgedSession<E, T> {
    engine: E,
    io: Option<TransportBridge<T>>,
    state: SessionState,
    peer_name: Option<String>,
    peer_closed: bool,
    leftover: StreamBuffer,
    plain: Vec<u8>,
    last_error: Option<Error>,
}

impl<E: ManagedEngine, T: TransportAdapter> BridgedSession<E, T> {
    pub fn new(engine: E) -> Self {
        BridgedSession {
            engine,
            io: None,
            state: SessionState::Uninitialized,
            peer_name: None,
            peer_closed: false,
            leftover: StreamBuffer::new(),
            plain: Vec::new(),
            last_error: None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn transport(&self) -> Option<&T> {
        self.io.as_ref().map(|io| io.transport())
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.io.as_mut().map(|io| io.transport_mut())
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// Plaintext held back because the caller's buffer was full
    pub fn buffered_plaintext(&self) -> usize {
        self.leftover.len()
    }

    fn fail(&mut self, err: Error) -> Step {
        log::error!("bridged TLS session failed: {}", err);
        self.state = SessionState::Failed;
        self.last_error = Some(err);
        Step::Failed
    }

    /// Map an engine status, honoring a `WouldBlock` the transport reported
    fn translate(&mut self, status: BridgeStatus) -> Step {
        let last = self.io.as_ref().and_then(|io| io.last_result());
        match status {
            BridgeStatus::Ok => Step::Success,
            BridgeStatus::WouldBlock => Step::WouldBlock,
            BridgeStatus::Closed if self.state == SessionState::Handshaking => {
                self.fail(Error::UnexpectedEof)
            }
            BridgeStatus::Closed => {
                log::debug!("peer closed the bridged session");
                self.peer_closed = true;
                Step::Success
            }
            BridgeStatus::Error(_) if last == Some(SessionResult::WouldBlock) => Step::WouldBlock,
            BridgeStatus::Error(_) if last == Some(SessionResult::Failed) => {
                self.fail(Error::Transport("bridge transport failed".to_string()))
            }
            BridgeStatus::Error(code) => self.fail(Error::Bridge(code)),
        }
    }

    fn handshake_step(&mut self) -> Step {
        match self.state {
            SessionState::Established => return Step::Success,
            SessionState::Failed | SessionState::Closing | SessionState::Closed => {
                return Step::Failed;
            }
            SessionState::Uninitialized => {
                if self.io.is_none() {
                    return self.fail(Error::NoTransport);
                }
                log::debug!("starting bridged handshake (peer {:?})", self.peer_name);
                self.state = SessionState::Handshaking;
            }
            SessionState::Handshaking => {}
        }

        let Some(io) = self.io.as_mut() else {
            return self.fail(Error::NoTransport);
        };
        let status = self.engine.handshake(io.begin_call());
        match self.translate(status) {
            Step::Success => {
                self.state = SessionState::Established;
                log::debug!("bridged handshake complete");
                Step::Success
            }
            other => other,
        }
    }

    fn deliver(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        (SessionResult::Success, self.leftover.read(buf))
    }
}

impl<E: ManagedEngine, T: TransportAdapter> Session for BridgedSession<E, T> {
    type Transport = T;

    fn set_peer_name(&mut self, name: &str) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(Error::HandshakeStarted);
        }
        match self.engine.set_peer_name(name) {
            BridgeStatus::Ok => {
                self.peer_name = Some(name.to_string());
                Ok(())
            }
            BridgeStatus::Error(code) => Err(Error::Bridge(code)),
            other => Err(Error::Ssl(format!("peer name rejected: {:?}", other))),
        }
    }

    fn set_transport(&mut self, transport: T) -> Result<()> {
        if self.io.is_some() {
            return Err(Error::TransportAlreadyBound);
        }
        self.io = Some(TransportBridge::new(transport));
        Ok(())
    }

    fn handshake(&mut self) -> SessionResult {
        self.handshake_step().public()
    }

    fn send(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        match self.handshake_step() {
            Step::Success => {}
            Step::Failed => return (SessionResult::Failed, 0),
            _ => return (SessionResult::WouldBlock, 0),
        }
        if buf.is_empty() {
            return (SessionResult::Success, 0);
        }

        let Some(io) = self.io.as_mut() else {
            return (self.fail(Error::NoTransport).public(), 0);
        };
        let chunk = &buf[..buf.len().min(BRIDGE_BUFFER_SIZE)];
        let (status, accepted) = self.engine.write(io.begin_call(), chunk);
        let accepted = accepted.min(chunk.len());
        match self.translate(status) {
            Step::Success => (SessionResult::Success, accepted),
            Step::WouldBlock if accepted > 0 => (SessionResult::Success, accepted),
            step => (step.public(), 0),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        if self.state.is_terminal() {
            return (SessionResult::Failed, 0);
        }
        if buf.is_empty() {
            return (SessionResult::Success, 0);
        }
        // Surplus from an earlier call is replayed first.
        if !self.leftover.is_empty() {
            return self.deliver(buf);
        }
        if self.peer_closed {
            return (SessionResult::Success, 0);
        }
        match self.handshake_step() {
            Step::Success => {}
            Step::Failed => return (SessionResult::Failed, 0),
            _ => return (SessionResult::WouldBlock, 0),
        }

        let Some(io) = self.io.as_mut() else {
            return (self.fail(Error::NoTransport).public(), 0);
        };
        self.plain.clear();
        let status = self.engine.read(io.begin_call(), &mut self.plain, buf.len());
        let step = self.translate(status);
        if step == Step::Failed {
            self.plain.clear();
            return (SessionResult::Failed, 0);
        }

        let n = self.plain.len().min(buf.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        if self.plain.len() > n {
            log::trace!("holding {} surplus plaintext bytes", self.plain.len() - n);
            self.leftover.write(&self.plain[n..]);
        }

        match step {
            _ if n > 0 => (SessionResult::Success, n),
            Step::Success if self.peer_closed => (SessionResult::Success, 0),
            _ => (SessionResult::WouldBlock, 0),
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

        let Some(io) = self.io.as_mut() else {
            self.state = SessionState::Closed;
            return SessionResult::Success;
        };
        self.state = SessionState::Closing;
        let status = self.engine.close(io.begin_call());
        match self.translate(status) {
            Step::Success => {
                log::debug!("bridged session closed");
                self.state = SessionState::Closed;
                SessionResult::Success
            }
            step => step.public(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryPipe, PipeEnd};

    const FIN: [u8; 2] = [0xff, 0xff];

    /// Engine with a two-message handshake and length-prefixed frames
    struct FramingEngine {
        client: bool,
        hello_sent: bool,
        inbound: Vec<u8>,
        outbound: Vec<u8>,
    }

    impl FramingEngine {
        fn new(client: bool) -> Self {
            FramingEngine {
                client,
                hello_sent: false,
                inbound: Vec::new(),
                outbound: Vec::new(),
            }
        }

        fn pull(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            let mut buf = [0u8; 1024];
            let (status, n) = io.read(&mut buf);
            self.inbound.extend_from_slice(&buf[..n]);
            status
        }

        fn flush(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            while !self.outbound.is_empty() {
                let (status, n) = io.write(&self.outbound);
                self.outbound.drain(..n);
                if status != BridgeStatus::Ok {
                    return status;
                }
            }
            BridgeStatus::Ok
        }

        fn take_token(&mut self, token: &[u8]) -> bool {
            if self.inbound.starts_with(token) {
                self.inbound.drain(..token.len());
                true
            } else {
                false
            }
        }
    }

    impl ManagedEngine for FramingEngine {
        fn set_peer_name(&mut self, name: &str) -> BridgeStatus {
            if name.is_empty() {
                BridgeStatus::Error(22)
            } else {
                BridgeStatus::Ok
            }
        }

        fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            if self.client && !self.hello_sent {
                self.outbound.extend_from_slice(b"HELO");
                self.hello_sent = true;
            }
            let status = self.flush(io);
            if status != BridgeStatus::Ok {
                return status;
            }
            let status = self.pull(io);
            let expected: &[u8] = if self.client { b"OKAY" } else { b"HELO" };
            if self.take_token(expected) {
                if !self.client {
                    self.outbound.extend_from_slice(b"OKAY");
                    return self.flush(io);
                }
                return BridgeStatus::Ok;
            }
            match status {
                BridgeStatus::Ok => BridgeStatus::WouldBlock,
                other => other,
            }
        }

        fn write(&mut self, io: &mut dyn BridgeIo, data: &[u8]) -> (BridgeStatus, usize) {
            let len = data.len().min(0xfffe);
            self.outbound.extend_from_slice(&(len as u16).to_be_bytes());
            self.outbound.extend_from_slice(&data[..len]);
            match self.flush(io) {
                BridgeStatus::Error(code) => (BridgeStatus::Error(code), 0),
                _ => (BridgeStatus::Ok, len),
            }
        }

        fn read(&mut self, io: &mut dyn BridgeIo, out: &mut Vec<u8>, _hint: usize) -> BridgeStatus {
            let status = self.pull(io);
            loop {
                if self.take_token(&FIN) {
                    return BridgeStatus::Closed;
                }
                if self.inbound.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize;
                if self.inbound.len() < 2 + len {
                    break;
                }
                out.extend_from_slice(&self.inbound[2..2 + len]);
                self.inbound.drain(..2 + len);
            }
            match status {
                BridgeStatus::Ok if out.is_empty() => BridgeStatus::WouldBlock,
                BridgeStatus::WouldBlock if !out.is_empty() => BridgeStatus::Ok,
                other => other,
            }
        }

        fn close(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            self.outbound.extend_from_slice(&FIN);
            self.flush(io)
        }
    }

    type Framed = BridgedSession<FramingEngine, PipeEnd>;

    fn pair() -> (Framed, Framed) {
        let (a, b) = MemoryPipe::pair();
        let mut client = BridgedSession::new(FramingEngine::new(true));
        let mut server = BridgedSession::new(FramingEngine::new(false));
        client.set_transport(a).unwrap();
        server.set_transport(b).unwrap();
        (client, server)
    }

    fn establish(client: &mut Framed, server: &mut Framed) {
        assert_eq!(client.handshake(), SessionResult::WouldBlock);
        assert_eq!(server.handshake(), SessionResult::Success);
        assert_eq!(client.handshake(), SessionResult::Success);
    }

    #[test]
    fn test_surplus_plaintext_is_replayed() {
        let (mut client, mut server) = pair();
        establish(&mut client, &mut server);

        let message: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(client.send(&message), (SessionResult::Success, 600));

        let mut received = Vec::new();
        let mut buf = [0u8; 7];
        let (result, n) = server.receive(&mut buf);
        assert_eq!((result, n), (SessionResult::Success, 7));
        received.extend_from_slice(&buf[..n]);
        assert_eq!(server.buffered_plaintext(), 593);

        let reads = server.transport().unwrap().read_calls();
        while received.len() < message.len() {
            let (result, n) = server.receive(&mut buf);
            assert_eq!(result, SessionResult::Success);
            received.extend_from_slice(&buf[..n]);
        }
        // Replays never touch the transport.
        assert_eq!(server.transport().unwrap().read_calls(), reads);
        assert_eq!(received, message);
    }

    #[test]
    fn test_receive_without_data_would_block() {
        let (mut client, mut server) = pair();
        establish(&mut client, &mut server);

        let mut buf = [0u8; 16];
        assert_eq!(server.receive(&mut buf), (SessionResult::WouldBlock, 0));
    }

    #[test]
    fn test_peer_close_reported_as_end_of_stream() {
        let (mut client, mut server) = pair();
        establish(&mut client, &mut server);

        client.send(b"last words");
        assert_eq!(client.close(), SessionResult::Success);
        assert_eq!(client.close(), SessionResult::Success);

        let mut buf = [0u8; 64];
        let (result, n) = server.receive(&mut buf);
        assert_eq!(result, SessionResult::Success);
        assert_eq!(&buf[..n], b"last words");
        assert!(server.is_peer_closed());
        assert_eq!(server.receive(&mut buf), (SessionResult::Success, 0));
    }

    #[test]
    fn test_transport_failure() {
        let (mut client, mut server) = pair();
        establish(&mut client, &mut server);

        client.transport_mut().unwrap().break_pipe();
        assert_eq!(client.send(b"data"), (SessionResult::Failed, 0));
        assert!(matches!(client.last_error(), Some(Error::Transport(_))));
        assert_eq!(client.send(b"data"), (SessionResult::Failed, 0));
    }

    #[test]
    fn test_peer_name_errors_cross_the_bridge() {
        let (mut client, _server) = pair();
        assert!(matches!(client.set_peer_name(""), Err(Error::Bridge(22))));
        client.set_peer_name("example.com").unwrap();
        assert_eq!(client.peer_name(), Some("example.com"));
    }

    /// Engine that reports its own error code whenever the transport has no data
    struct OpaqueEngine;

    impl ManagedEngine for OpaqueEngine {
        fn set_peer_name(&mut self, _name: &str) -> BridgeStatus {
            BridgeStatus::Ok
        }

        fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            let mut buf = [0u8; 8];
            match io.read(&mut buf) {
                (BridgeStatus::Ok, _) => BridgeStatus::Error(40),
                _ => BridgeStatus::Error(-35),
            }
        }

        fn write(&mut self, _io: &mut dyn BridgeIo, _data: &[u8]) -> (BridgeStatus, usize) {
            (BridgeStatus::Error(-35), 0)
        }

        fn read(&mut self, _io: &mut dyn BridgeIo, _out: &mut Vec<u8>, _hint: usize) -> BridgeStatus {
            BridgeStatus::Error(-35)
        }

        fn close(&mut self, _io: &mut dyn BridgeIo) -> BridgeStatus {
            BridgeStatus::Ok
        }
    }

    #[test]
    fn test_callback_would_block_forwarded() {
        let (a, mut b) = MemoryPipe::pair();
        let mut session = BridgedSession::new(OpaqueEngine);
        session.set_transport(a).unwrap();

        assert_eq!(session.handshake(), SessionResult::WouldBlock);
        assert_eq!(session.handshake(), SessionResult::WouldBlock);

        b.write(b"garbage");
        assert_eq!(session.handshake(), SessionResult::Failed);
        assert!(matches!(session.last_error(), Some(Error::Bridge(40))));
    }

    /// Waits for input once, then rejects the peer without touching the transport
    struct RejectingEngine {
        calls: usize,
    }

    impl ManagedEngine for RejectingEngine {
        fn set_peer_name(&mut self, _name: &str) -> BridgeStatus {
            BridgeStatus::Ok
        }

        fn handshake(&mut self, io: &mut dyn BridgeIo) -> BridgeStatus {
            self.calls += 1;
            if self.calls == 1 {
                let mut buf = [0u8; 8];
                return match io.read(&mut buf) {
                    (BridgeStatus::WouldBlock, _) => BridgeStatus::WouldBlock,
                    _ => BridgeStatus::Error(-1),
                };
            }
            BridgeStatus::Error(48)
        }

        fn write(&mut self, _io: &mut dyn BridgeIo, _data: &[u8]) -> (BridgeStatus, usize) {
            (BridgeStatus::Error(48), 0)
        }

        fn read(&mut self, _io: &mut dyn BridgeIo, _out: &mut Vec<u8>, _hint: usize) -> BridgeStatus {
            BridgeStatus::Error(48)
        }

        fn close(&mut self, _io: &mut dyn BridgeIo) -> BridgeStatus {
            BridgeStatus::Ok
        }
    }

    #[test]
    fn test_earlier_would_block_does_not_mask_engine_error() {
        let (a, _b) = MemoryPipe::pair();
        let mut session = BridgedSession::new(RejectingEngine { calls: 0 });
        session.set_transport(a).unwrap();

        assert_eq!(session.handshake(), SessionResult::WouldBlock);
        assert_eq!(session.handshake(), SessionResult::Failed);
        assert!(matches!(session.last_error(), Some(Error::Bridge(48))));
        assert_eq!(session.handshake(), SessionResult::Failed);
    }
}
