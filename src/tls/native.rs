//! Native-library session adapter
//!
//! When the TLS library owns the record layer and only needs byte I/O
//! callbacks, the adapter is thin: OpenSSL's `SslStream` runs over a
//! [`CallbackIo`] that forwards to the session's [`TransportAdapter`], and
//! the library's retry codes are mapped onto [`SessionResult`].

use super::info::SessionInfo;
use crate::session::{
    Error, Result, Session, SessionResult, SessionState, Step, TransportAdapter,
};
use openssl::ssl::{self, ErrorCode, ShutdownResult, Ssl, SslStream};
use std::io::{self, Read, Write};

/// `Read + Write` shim that forwards to a [`TransportAdapter`]
///
/// `WouldBlock` becomes an `io::ErrorKind::WouldBlock` error so OpenSSL
/// reports a retry; `Failed` becomes a hard error and is remembered.
pub struct CallbackIo<T> {
    transport: T,
    failed: bool,
    eof: bool,
}

impl<T: TransportAdapter> CallbackIo<T> {
    fn new(transport: T) -> Self {
        CallbackIo {
            transport,
            failed: false,
            eof: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: TransportAdapter> Read for CallbackIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.transport.read(buf) {
            (SessionResult::Success, n) => {
                if n == 0 && !buf.is_empty() {
                    self.eof = true;
                }
                Ok(n)
            }
            (SessionResult::WouldBlock, _) => Err(io::ErrorKind::WouldBlock.into()),
            (SessionResult::Failed, _) => {
                self.failed = true;
                Err(io::Error::new(io::ErrorKind::Other, "transport read failed"))
            }
        }
    }
}

impl<T: TransportAdapter> Write for CallbackIo<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.transport.write(buf) {
            (SessionResult::Success, n) => Ok(n),
            (SessionResult::WouldBlock, _) => Err(io::ErrorKind::WouldBlock.into()),
            (SessionResult::Failed, _) => {
                self.failed = true;
                Err(io::Error::new(io::ErrorKind::Other, "transport write failed"))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Inner<T> {
    Configured { ssl: Ssl, transport: Option<T> },
    Active(SslStream<CallbackIo<T>>),
    Released,
}

/// Which operation a library error came from
#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Data,
    Shutdown,
}

/// [`Session`] over OpenSSL's own record layer
///
/// Renegotiation and post-handshake messages are handled inside OpenSSL
/// and never surface. When `send` reports `WouldBlock`, retry with the same
/// bytes; the configuration enables moving-buffer retries so the caller's
/// buffer may be reallocated in between.
pub struct NativeSession<T> {
    inner: Inner<T>,
    is_server: bool,
    state: SessionState,
    peer_name: Option<String>,
    peer_closed: bool,
    last_error: Option<Error>,
}

impl<T: TransportAdapter> NativeSession<T> {
    pub fn client(ssl: Ssl) -> Self {
        Self::new(ssl, false)
    }

    pub fn server(ssl: Ssl) -> Self {
        Self::new(ssl, true)
    }

    fn new(ssl: Ssl, is_server: bool) -> Self {
        NativeSession {
            inner: Inner::Configured {
                ssl,
                transport: None,
            },
            is_server,
            state: SessionState::Uninitialized,
            peer_name: None,
            peer_closed: false,
            last_error: None,
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn transport(&self) -> Option<&T> {
        match &self.inner {
            Inner::Configured { transport, .. } => transport.as_ref(),
            Inner::Active(stream) => Some(stream.get_ref().transport()),
            Inner::Released => None,
        }
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        match &mut self.inner {
            Inner::Configured { transport, .. } => transport.as_mut(),
            Inner::Active(stream) => Some(stream.get_mut().transport_mut()),
            Inner::Released => None,
        }
    }

    /// Negotiated parameters, available once the handshake has started
    pub fn info(&self) -> Option<SessionInfo> {
        match &self.inner {
            Inner::Active(stream) => Some(SessionInfo::from_ssl(stream.ssl())),
            _ => None,
        }
    }

    fn fail(&mut self, err: Error) -> Step {
        log::error!("TLS session failed: {}", err);
        self.state = SessionState::Failed;
        self.last_error = Some(err);
        Step::Failed
    }

    /// Bind the transport to the OpenSSL connection on first use
    fn activate(&mut self) -> Step {
        if let Inner::Active(_) = self.inner {
            return Step::Success;
        }
        match std::mem::replace(&mut self.inner, Inner::Released) {
            Inner::Configured {
                mut ssl,
                transport: Some(transport),
            } => {
                if self.is_server {
                    ssl.set_accept_state();
                } else {
                    ssl.set_connect_state();
                }
                match SslStream::new(ssl, CallbackIo::new(transport)) {
                    Ok(stream) => {
                        self.inner = Inner::Active(stream);
                        Step::Success
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            Inner::Configured {
                ssl,
                transport: None,
            } => {
                self.inner = Inner::Configured {
                    ssl,
                    transport: None,
                };
                self.fail(Error::NoTransport)
            }
            Inner::Active(_) | Inner::Released => self.fail(Error::Closed),
        }
    }

    /// Map a library error onto a step, recording fatal causes
    fn translate(&mut self, err: ssl::Error, phase: Phase) -> Step {
        let (transport_failed, eof) = match &self.inner {
            Inner::Active(stream) => (stream.get_ref().failed, stream.get_ref().eof),
            _ => (false, false),
        };

        match err.code() {
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Step::WouldBlock,
            ErrorCode::ZERO_RETURN if phase == Phase::Data => {
                self.peer_closed = true;
                log::debug!("peer closed the TLS session");
                Step::Success
            }
            _ if transport_failed => self.fail(Error::Transport(err.to_string())),
            ErrorCode::SYSCALL
                if err
                    .io_error()
                    .is_some_and(|e| e.kind() == io::ErrorKind::WouldBlock) =>
            {
                Step::WouldBlock
            }
            _ if eof && phase == Phase::Handshake => self.fail(Error::UnexpectedEof),
            _ if eof && phase == Phase::Data => {
                log::debug!("transport closed without close_notify");
                self.peer_closed = true;
                Step::Success
            }
            _ => self.fail(Error::Ssl(err.to_string())),
        }
    }

    fn handshake_step(&mut self) -> Step {
        match self.state {
            SessionState::Established => return Step::Success,
            SessionState::Failed | SessionState::Closing | SessionState::Closed => {
                return Step::Failed;
            }
            SessionState::Uninitialized => {
                if self.activate() == Step::Failed {
                    return Step::Failed;
                }
                log::debug!("starting handshake (peer {:?})", self.peer_name);
                self.state = SessionState::Handshaking;
            }
            SessionState::Handshaking => {}
        }

        let Inner::Active(stream) = &mut self.inner else {
            return self.fail(Error::NoTransport);
        };
        match stream.do_handshake() {
            Ok(()) => {
                self.state = SessionState::Established;
                log::debug!(
                    "handshake complete: {} {}",
                    stream.ssl().version_str(),
                    stream
                        .ssl()
                        .current_cipher()
                        .map(|c| c.name())
                        .unwrap_or("<none>")
                );
                Step::Success
            }
            Err(e) => self.translate(e, Phase::Handshake),
        }
    }
}

impl<T: TransportAdapter> Session for NativeSession<T> {
    type Transport = T;

    fn set_peer_name(&mut self, name: &str) -> Result<()> {
        let Inner::Configured { ssl, .. } = &mut self.inner else {
            return Err(Error::HandshakeStarted);
        };
        if self.state != SessionState::Uninitialized {
            return Err(Error::HandshakeStarted);
        }
        ssl.set_hostname(name)?;
        if !self.is_server {
            ssl.param_mut().set_host(name)?;
        }
        self.peer_name = Some(name.to_string());
        Ok(())
    }

    fn set_transport(&mut self, transport: T) -> Result<()> {
        match &mut self.inner {
            Inner::Configured {
                transport: slot @ None,
                ..
            } => {
                *slot = Some(transport);
                Ok(())
            }
            _ => Err(Error::TransportAlreadyBound),
        }
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

        let Inner::Active(stream) = &mut self.inner else {
            return (SessionResult::Failed, 0);
        };
        match stream.ssl_write(buf) {
            Ok(n) => {
                log::trace!("==> {} bytes accepted", n);
                (SessionResult::Success, n)
            }
            Err(e) => (self.translate(e, Phase::Data).public(), 0),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        if self.peer_closed && !self.state.is_terminal() {
            return (SessionResult::Success, 0);
        }
        match self.handshake_step() {
            Step::Success => {}
            Step::Failed => return (SessionResult::Failed, 0),
            _ => return (SessionResult::WouldBlock, 0),
        }
        if buf.is_empty() {
            return (SessionResult::Success, 0);
        }

        let Inner::Active(stream) = &mut self.inner else {
            return (SessionResult::Failed, 0);
        };
        match stream.ssl_read(buf) {
            Ok(n) => {
                log::trace!("<== {} bytes decrypted", n);
                (SessionResult::Success, n)
            }
            Err(e) => (self.translate(e, Phase::Data).public(), 0),
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

        let Inner::Active(stream) = &mut self.inner else {
            self.state = SessionState::Closed;
            return SessionResult::Success;
        };
        self.state = SessionState::Closing;
        match stream.shutdown() {
            Ok(ShutdownResult::Sent) | Ok(ShutdownResult::Received) => {
                log::debug!("TLS shutdown sent");
                self.state = SessionState::Closed;
                SessionResult::Success
            }
            Err(e) => match self.translate(e, Phase::Shutdown) {
                Step::WouldBlock => SessionResult::WouldBlock,
                _ => SessionResult::Failed,
            },
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
