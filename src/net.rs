//! Sessions over non-blocking TCP sockets
//!
//! [`SocketTransport`] is the [`TransportAdapter`] for a `socket2::Socket`
//! in non-blocking mode. [`SecureSocket`] pairs one with a session and adds
//! readiness polling so callers can wait between `WouldBlock` results.

use crate::session::transport::{map_read, map_write};
use crate::session::{Error, Result, Session, SessionResult, SessionState, TransportAdapter};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Readiness to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Transport over a shared non-blocking socket
#[derive(Debug, Clone)]
pub struct SocketTransport {
    socket: Arc<Socket>,
}

impl SocketTransport {
    pub fn new(socket: Arc<Socket>) -> Self {
        SocketTransport { socket }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl TransportAdapter for SocketTransport {
    fn write(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        let result = (&*self.socket).write(buf);
        if let Err(e) = &result {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::warn!("socket write failed: {}", e);
            }
        }
        map_write(&result, buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        let result = (&*self.socket).read(buf);
        if let Err(e) = &result {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::warn!("socket read failed: {}", e);
            }
        }
        map_read(&result, buf.len())
    }
}

/// Wait for readiness on a raw descriptor; `Ok(false)` on timeout
fn poll_fd(fd: libc::c_int, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(result > 0)
}

/// A session bound to a TCP socket
pub struct SecureSocket<S> {
    socket: Arc<Socket>,
    session: S,
}

impl<S: Session<Transport = SocketTransport>> SecureSocket<S> {
    /// Switch `socket` to non-blocking mode and bind it to `session`
    pub fn new(socket: Socket, mut session: S) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let socket = Arc::new(socket);
        session.set_transport(SocketTransport::new(Arc::clone(&socket)))?;
        Ok(SecureSocket { socket, session })
    }

    pub fn from_tcp(stream: TcpStream, session: S) -> Result<Self> {
        Self::new(Socket::from(stream), session)
    }

    /// Connect to `addr` (blocking, bounded by `timeout`) and bind the session
    pub fn connect(addr: SocketAddr, timeout: Duration, session: S) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&SockAddr::from(addr), timeout)?;
        log::debug!("connected to {}", addr);
        Self::new(socket, session)
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn handshake(&mut self) -> SessionResult {
        self.session.handshake()
    }

    pub fn send(&mut self, buf: &[u8]) -> (SessionResult, usize) {
        self.session.send(buf)
    }

    pub fn receive(&mut self, buf: &mut [u8]) -> (SessionResult, usize) {
        self.session.receive(buf)
    }

    /// Close the session and, once its shutdown is flushed, the write half
    pub fn close(&mut self) -> SessionResult {
        let result = self.session.close();
        if result == SessionResult::Success {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                log::debug!("socket shutdown: {}", e);
            }
        }
        result
    }

    /// Wait until the socket is ready; `Ok(false)` on timeout
    pub fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        Ok(poll_fd(self.socket.as_raw_fd(), events, timeout)?)
    }

    /// Drive the handshake to completion, polling between steps
    pub fn wait_handshake(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.session.handshake() {
                SessionResult::Success => return Ok(()),
                SessionResult::Failed => return Err(self.failure("handshake failed")),
                SessionResult::WouldBlock => {}
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.poll(PollEvents::Read, Some(left))? {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timed out",
                )));
            }
        }
    }

    /// Send all of `buf`, polling while the session would block
    pub fn send_all(&mut self, mut buf: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !buf.is_empty() {
            match self.session.send(buf) {
                (SessionResult::Success, n) => buf = &buf[n..],
                (SessionResult::Failed, _) => return Err(self.failure("send failed")),
                (SessionResult::WouldBlock, _) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() || !self.poll(PollEvents::Both, Some(left))? {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "send timed out",
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn failure(&self, what: &str) -> Error {
        match self.session.last_error() {
            Some(e) => Error::Ssl(format!("{}: {}", what, e)),
            None if self.session.state() == SessionState::Closed => Error::Closed,
            None => Error::Ssl(what.to_string()),
        }
    }
}
