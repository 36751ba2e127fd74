//! Session contract shared by every TLS backend
//!
//! A session sits between a non-blocking [`TransportAdapter`] and application
//! code. All operations are non-blocking: they either finish a bounded amount
//! of work or report [`SessionResult::WouldBlock`] so the caller can retry
//! once the transport is ready again.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Handshaking -> Established -> Closing -> Closed
//!                       ^              |
//!                       +--------------+  (renegotiation)
//! ```
//!
//! Any protocol or transport failure moves the session to
//! [`SessionState::Failed`], after which every call returns
//! [`SessionResult::Failed`] without touching the transport.

pub mod pipe;
pub mod transport;

pub use pipe::{MemoryPipe, PipeEnd};
pub use transport::{IoTransport, TransportAdapter};

use crate::channel::ProviderError;
use crate::tls::TlsError;

/// Result type for session setup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a session or transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    /// The operation completed
    Success,
    /// No progress possible right now; retry once the transport is ready
    WouldBlock,
    /// Unrecoverable; the session must be torn down
    Failed,
}

impl SessionResult {
    pub fn is_success(self) -> bool {
        self == SessionResult::Success
    }

    pub fn is_would_block(self) -> bool {
        self == SessionResult::WouldBlock
    }

    pub fn is_failed(self) -> bool {
        self == SessionResult::Failed
    }
}

/// Internal step outcome; the last two variants never reach callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Success,
    WouldBlock,
    Failed,
    /// Not enough ciphertext buffered to decode one record
    IncompleteRecord,
    /// Peer asked for a new handshake mid-stream
    RenegotiationRequested,
}

impl Step {
    pub(crate) fn public(self) -> SessionResult {
        match self {
            Step::Success | Step::RenegotiationRequested => SessionResult::Success,
            Step::WouldBlock | Step::IncompleteRecord => SessionResult::WouldBlock,
            Step::Failed => SessionResult::Failed,
        }
    }
}

impl From<SessionResult> for Step {
    fn from(result: SessionResult) -> Self {
        match result {
            SessionResult::Success => Step::Success,
            SessionResult::WouldBlock => Step::WouldBlock,
            SessionResult::Failed => Step::Failed,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether the session can no longer move data
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Maximum ciphertext buffered per queue (64 KiB)
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// Bytes requested per transport read: one maximal TLS record plus overhead
pub const DEFAULT_READ_CHUNK: usize = 17 * 1024;

/// Buffering limits for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Cap on buffered ciphertext in either direction
    pub max_buffered: usize,
    /// Bytes requested from the transport per read
    pub read_chunk: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            max_buffered: DEFAULT_MAX_BUFFERED,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// Session errors
///
/// Operations report [`SessionResult::Failed`]; the cause is kept and can be
/// read back through [`Session::last_error`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Peer name must be set before the handshake starts")]
    HandshakeStarted,

    #[error("Transport already bound")]
    TransportAlreadyBound,

    #[error("No transport bound")]
    NoTransport,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Connection closed by peer during handshake")]
    UnexpectedEof,

    #[error("Session is closed")]
    Closed,

    #[error("Security provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("SSL error: {0}")]
    Ssl(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("Bridge error code {0}")]
    Bridge(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),
}

/// Uniform non-blocking TLS session
///
/// Implementations exist for the record-buffering engine
/// ([`crate::channel::RecordSession`]), the OpenSSL-backed native adapter
/// ([`crate::tls::NativeSession`]) and the bridged adapter
/// ([`crate::bridge::BridgedSession`]). A session is driven by one flow of
/// control at a time; there is no internal locking.
pub trait Session {
    /// Byte-level I/O capability the session calls back into
    type Transport: TransportAdapter;

    /// Set the peer host name used for SNI and certificate validation
    ///
    /// Fails once the handshake has started.
    fn set_peer_name(&mut self, name: &str) -> Result<()>;

    /// Bind the transport; allowed exactly once
    fn set_transport(&mut self, transport: Self::Transport) -> Result<()>;

    /// Advance the handshake by one step
    ///
    /// Returns `Success` only once the session is established and its
    /// handshake output has been flushed.
    fn handshake(&mut self) -> SessionResult;

    /// Encrypt and flush caller data, reporting how many bytes were accepted
    fn send(&mut self, buf: &[u8]) -> (SessionResult, usize);

    /// Deliver decrypted bytes into `buf`, reporting how many were produced
    ///
    /// `Success` with zero bytes means either that a renegotiation was
    /// absorbed or that the peer closed the stream (see
    /// [`Session::is_peer_closed`]).
    fn receive(&mut self, buf: &mut [u8]) -> (SessionResult, usize);

    /// Send the shutdown notification and flush; idempotent
    fn close(&mut self) -> SessionResult;

    /// Current lifecycle state
    fn state(&self) -> SessionState;

    /// Whether the peer closed its side of the stream
    fn is_peer_closed(&self) -> bool;

    /// Cause of the last failure, if any
    fn last_error(&self) -> Option<&Error>;
}
