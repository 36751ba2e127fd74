//! nbtls - non-blocking TLS session layer
//!
//! This crate sits between a non-blocking byte transport (usually a socket)
//! and application code exchanging plaintext. A session negotiates TLS, then
//! encrypts outgoing bytes and decrypts incoming ciphertext without ever
//! blocking the calling thread.
//!
//! Three backend shapes share the [`session::Session`] contract:
//!
//! - [`channel::RecordSession`] owns record framing and all buffering on top
//!   of a primitive [`channel::SecurityProvider`].
//! - [`tls::NativeSession`] forwards to OpenSSL, which frames records itself
//!   and pulls raw bytes through transport callbacks.
//! - [`bridge::BridgedSession`] drives a [`bridge::ManagedEngine`] across a
//!   copying bridge and replays surplus plaintext.
//!
//! [`net::SecureSocket`] layers any of them over a non-blocking socket.

pub mod buffer;
pub mod bridge;
pub mod channel;
pub mod net;
pub mod session;
pub mod tls;

pub use buffer::StreamBuffer;
pub use session::{
    Error, Result, Session, SessionLimits, SessionResult, SessionState, TransportAdapter,
};
