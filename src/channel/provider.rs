//! Primitive security provider contract
//!
//! A provider exposes only the low-level operations of a secure-channel
//! style API: negotiate one handshake step, encrypt one record, decrypt one
//! record, and produce a shutdown token. It performs no I/O and keeps no
//! ciphertext queues; the [`super::RecordSession`] owns both.

use crate::buffer::StreamBuffer;

/// Record layout reported by the provider once negotiation is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSizes {
    /// Bytes reserved in front of the payload
    pub header: usize,
    /// Maximum bytes reserved behind the payload
    pub trailer: usize,
    /// Largest plaintext chunk one record may carry
    pub max_message: usize,
}

impl StreamSizes {
    /// Size of a fully framed record carrying `message_len` bytes
    pub fn record_len(&self, message_len: usize) -> usize {
        self.header + message_len + self.trailer
    }
}

/// Outcome of one negotiate step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateStatus {
    /// The handshake is complete
    Complete,
    /// More handshake messages are needed from the peer
    ContinueNeeded,
    /// The input does not hold a complete message; nothing was consumed
    IncompleteMessage,
}

/// Outcome of one decrypt step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStatus {
    /// One record was decoded; its plaintext (possibly none) was appended
    Ok,
    /// The input does not hold a complete record; nothing was consumed
    IncompleteMessage,
    /// The peer wants to renegotiate; the next negotiate step answers it
    Renegotiate,
    /// The peer closed the security context
    ContextExpired,
}

/// A provider step: status plus the number of unprocessed trailing input bytes
///
/// `extra` counts bytes at the end of the input that belong to later
/// messages. Everything before them was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step<S> {
    pub status: S,
    pub extra: usize,
}

impl<S> Step<S> {
    pub fn new(status: S, extra: usize) -> Self {
        Step { status, extra }
    }

    /// Bytes consumed from an input of `input_len` bytes
    pub fn consumed(&self, input_len: usize) -> usize {
        input_len.saturating_sub(self.extra)
    }
}

/// Provider errors
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Security context not negotiated")]
    NotNegotiated,

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Record buffer too small: need {needed} bytes")]
    BufferTooSmall { needed: usize },

    #[error("Negotiation failed: {0}")]
    Negotiate(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Shutdown failed: {0}")]
    Shutdown(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Low-level secure-channel primitives
///
/// Implementations own their native context exclusively and release it on
/// drop.
pub trait SecurityProvider {
    /// Set the target name used for SNI and certificate validation
    fn set_peer_name(&mut self, name: &str) -> Result<(), ProviderError>;

    /// Run one handshake step over `input`, appending any output token to `output`
    ///
    /// The first call may pass an empty input to start the handshake.
    fn negotiate(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<NegotiateStatus>, ProviderError>;

    /// Query the record layout; only valid after negotiation completes
    fn stream_sizes(&mut self) -> Result<StreamSizes, ProviderError>;

    /// Encrypt the payload framed in `record`
    ///
    /// `record` is laid out as `[header][message_len bytes][trailer]` using
    /// `sizes`. Returns the realized trailer length, which may be shorter
    /// than `sizes.trailer`.
    fn encrypt(
        &mut self,
        record: &mut [u8],
        sizes: &StreamSizes,
        message_len: usize,
    ) -> Result<usize, ProviderError>;

    /// Decrypt the first record in `input`, appending its plaintext to `output`
    fn decrypt(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<DecryptStatus>, ProviderError>;

    /// Append a shutdown notification token to `output`
    fn shutdown(&mut self, output: &mut StreamBuffer) -> Result<(), ProviderError>;
}

impl<P: SecurityProvider + ?Sized> SecurityProvider for Box<P> {
    fn set_peer_name(&mut self, name: &str) -> Result<(), ProviderError> {
        (**self).set_peer_name(name)
    }

    fn negotiate(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<NegotiateStatus>, ProviderError> {
        (**self).negotiate(input, output)
    }

    fn stream_sizes(&mut self) -> Result<StreamSizes, ProviderError> {
        (**self).stream_sizes()
    }

    fn encrypt(
        &mut self,
        record: &mut [u8],
        sizes: &StreamSizes,
        message_len: usize,
    ) -> Result<usize, ProviderError> {
        (**self).encrypt(record, sizes, message_len)
    }

    fn decrypt(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<DecryptStatus>, ProviderError> {
        (**self).decrypt(input, output)
    }

    fn shutdown(&mut self, output: &mut StreamBuffer) -> Result<(), ProviderError> {
        (**self).shutdown(output)
    }
}
