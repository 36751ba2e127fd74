//! OpenSSL-backed security provider
//!
//! OpenSSL is driven over an in-memory stream: the provider feeds it only
//! complete TLS records and collects whatever it writes. This gives the
//! record engine the same primitive view a platform secure-channel API
//! would: one handshake step, one record in, one record out.

use super::provider::{
    DecryptStatus, NegotiateStatus, ProviderError, SecurityProvider, Step, StreamSizes,
};
use crate::buffer::StreamBuffer;
use crate::tls::SessionInfo;
use bytes::{Buf, BytesMut};
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use std::io::{self, Read, Write};

/// TLS record header: content type, version, 16-bit length
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext fragment a record may carry
pub const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// Room reserved behind each payload for MAC, padding and tag, plus any
/// post-handshake message OpenSSL emits in front of the record
pub const RECORD_EXPANSION: usize = 2048;

/// Largest ciphertext body accepted from the peer
const MAX_CIPHERTEXT_LEN: usize = MAX_FRAGMENT_LEN + RECORD_EXPANSION;

/// Length of the first record in `input`, if it is complete
pub fn complete_record_len(input: &[u8]) -> Result<Option<usize>, ProviderError> {
    if input.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let body = u16::from_be_bytes([input[3], input[4]]) as usize;
    if body > MAX_CIPHERTEXT_LEN {
        return Err(ProviderError::MalformedRecord(format!(
            "record length {} exceeds {}",
            body, MAX_CIPHERTEXT_LEN
        )));
    }
    let total = RECORD_HEADER_LEN + body;
    Ok((input.len() >= total).then_some(total))
}

/// In-memory stream OpenSSL reads ciphertext from and writes ciphertext to
#[derive(Debug, Default)]
struct MemoryStream {
    incoming: BytesMut,
    outgoing: BytesMut,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.advance(n);
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Context {
    /// Peer name and role may still change
    Configured(Ssl),
    Active(SslStream<MemoryStream>),
    Released,
}

/// [`SecurityProvider`] over an OpenSSL connection
pub struct OpensslProvider {
    context: Context,
    is_server: bool,
    started: bool,
    negotiated: bool,
    peer_closed: bool,
}

impl OpensslProvider {
    /// Provider for the connecting side
    pub fn client(ssl: Ssl) -> Self {
        Self::new(ssl, false)
    }

    /// Provider for the accepting side
    pub fn server(ssl: Ssl) -> Self {
        Self::new(ssl, true)
    }

    fn new(ssl: Ssl, is_server: bool) -> Self {
        OpensslProvider {
            context: Context::Configured(ssl),
            is_server,
            started: false,
            negotiated: false,
            peer_closed: false,
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Whether the handshake has completed at least once
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Negotiated parameters, once the handshake has started
    pub fn info(&self) -> Option<SessionInfo> {
        match &self.context {
            Context::Active(stream) => Some(SessionInfo::from_ssl(stream.ssl())),
            _ => None,
        }
    }

    fn stream(&mut self) -> Result<&mut SslStream<MemoryStream>, ProviderError> {
        if let Context::Configured(_) = self.context {
            let Context::Configured(mut ssl) =
                std::mem::replace(&mut self.context, Context::Released)
            else {
                return Err(ProviderError::NotNegotiated);
            };
            if self.is_server {
                ssl.set_accept_state();
            } else {
                ssl.set_connect_state();
            }
            self.context = Context::Active(SslStream::new(ssl, MemoryStream::default())?);
        }
        match &mut self.context {
            Context::Active(stream) => Ok(stream),
            _ => Err(ProviderError::NotNegotiated),
        }
    }

    fn has_pending_output(&self) -> bool {
        match &self.context {
            Context::Active(stream) => !stream.get_ref().outgoing.is_empty(),
            _ => false,
        }
    }

    fn active(&mut self) -> Result<&mut SslStream<MemoryStream>, ProviderError> {
        match &mut self.context {
            Context::Active(stream) => Ok(stream),
            _ => Err(ProviderError::NotNegotiated),
        }
    }
}

/// Move everything OpenSSL wrote into `output`, returning the byte count
fn drain_outgoing(stream: &mut SslStream<MemoryStream>, output: &mut StreamBuffer) -> usize {
    let outgoing = &mut stream.get_mut().outgoing;
    let n = output.write(&outgoing[..]);
    outgoing.clear();
    n
}

/// Unconsumed ciphertext left in OpenSSL's input
fn take_leftover(stream: &mut SslStream<MemoryStream>) -> usize {
    let incoming = &mut stream.get_mut().incoming;
    let n = incoming.len();
    incoming.clear();
    n
}

impl SecurityProvider for OpensslProvider {
    fn set_peer_name(&mut self, name: &str) -> Result<(), ProviderError> {
        let Context::Configured(ssl) = &mut self.context else {
            return Err(ProviderError::Negotiate(
                "peer name set after negotiation started".to_string(),
            ));
        };
        ssl.set_hostname(name)?;
        if !self.is_server {
            ssl.param_mut().set_host(name)?;
        }
        Ok(())
    }

    fn negotiate(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<NegotiateStatus>, ProviderError> {
        let mut fed = 0;
        while let Some(len) = complete_record_len(&input[fed..])? {
            fed += len;
        }
        // Output OpenSSL queued while decrypting (a renegotiation reply or a
        // key update) still has to go out even when no new record arrived.
        if fed == 0 && self.started && !self.has_pending_output() {
            return Ok(Step::new(NegotiateStatus::IncompleteMessage, input.len()));
        }

        self.started = true;
        let stream = self.stream()?;
        stream.get_mut().incoming.extend_from_slice(&input[..fed]);
        let result = stream.do_handshake();
        let produced = drain_outgoing(stream, output);
        let extra = take_leftover(stream) + (input.len() - fed);

        match result {
            Ok(()) => {
                self.negotiated = true;
                Ok(Step::new(NegotiateStatus::Complete, extra))
            }
            Err(e) if matches!(e.code(), ErrorCode::WANT_READ | ErrorCode::WANT_WRITE) => {
                if fed == 0 && produced == 0 {
                    Ok(Step::new(NegotiateStatus::IncompleteMessage, extra))
                } else {
                    Ok(Step::new(NegotiateStatus::ContinueNeeded, extra))
                }
            }
            Err(e) => {
                let verify = stream.ssl().verify_result();
                log::debug!("handshake failed: {} (verify result: {})", e, verify);
                Err(ProviderError::Negotiate(e.to_string()))
            }
        }
    }

    fn stream_sizes(&mut self) -> Result<StreamSizes, ProviderError> {
        if !self.negotiated {
            return Err(ProviderError::NotNegotiated);
        }
        Ok(StreamSizes {
            header: RECORD_HEADER_LEN,
            trailer: RECORD_EXPANSION,
            max_message: MAX_FRAGMENT_LEN,
        })
    }

    fn encrypt(
        &mut self,
        record: &mut [u8],
        sizes: &StreamSizes,
        message_len: usize,
    ) -> Result<usize, ProviderError> {
        let stream = self.active()?;
        let payload = &record[sizes.header..sizes.header + message_len];

        let written = stream
            .ssl_write(payload)
            .map_err(|e| ProviderError::Encrypt(e.to_string()))?;
        if written != message_len {
            return Err(ProviderError::Encrypt(format!(
                "short write: {} of {} bytes",
                written, message_len
            )));
        }

        let outgoing = &mut stream.get_mut().outgoing;
        let produced = outgoing.len();
        if produced > record.len() {
            return Err(ProviderError::BufferTooSmall { needed: produced });
        }
        if produced < sizes.header + message_len {
            return Err(ProviderError::Encrypt(format!(
                "record of {} bytes too short for {} byte payload",
                produced, message_len
            )));
        }
        record[..produced].copy_from_slice(&outgoing[..]);
        outgoing.clear();
        Ok(produced - sizes.header - message_len)
    }

    fn decrypt(
        &mut self,
        input: &[u8],
        output: &mut StreamBuffer,
    ) -> Result<Step<DecryptStatus>, ProviderError> {
        let Some(len) = complete_record_len(input)? else {
            return Ok(Step::new(DecryptStatus::IncompleteMessage, input.len()));
        };
        let extra = input.len() - len;
        if self.peer_closed {
            return Ok(Step::new(DecryptStatus::ContextExpired, extra));
        }

        let stream = self.active()?;
        stream.get_mut().incoming.extend_from_slice(&input[..len]);

        let mut plain = [0u8; 4096];
        let mut closed = false;
        loop {
            match stream.ssl_read(&mut plain) {
                Ok(0) => break,
                Ok(n) => {
                    output.write(&plain[..n]);
                }
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => break,
                    ErrorCode::ZERO_RETURN => {
                        closed = true;
                        break;
                    }
                    _ => return Err(ProviderError::Decrypt(e.to_string())),
                },
            }
        }
        take_leftover(stream);

        if closed {
            self.peer_closed = true;
            return Ok(Step::new(DecryptStatus::ContextExpired, extra));
        }
        // Anything OpenSSL wants to send in response stays queued for the
        // next negotiate step.
        if !stream.get_ref().outgoing.is_empty() {
            return Ok(Step::new(DecryptStatus::Renegotiate, extra));
        }
        Ok(Step::new(DecryptStatus::Ok, extra))
    }

    fn shutdown(&mut self, output: &mut StreamBuffer) -> Result<(), ProviderError> {
        let Context::Active(stream) = &mut self.context else {
            return Ok(());
        };
        match stream.shutdown() {
            Ok(_) => {}
            Err(e) if matches!(e.code(), ErrorCode::WANT_READ | ErrorCode::WANT_WRITE) => {}
            Err(e) => return Err(ProviderError::Shutdown(e.to_string())),
        }
        drain_outgoing(stream, output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsConfig;

    fn pair() -> (OpensslProvider, OpensslProvider) {
        let client = TlsConfig::client().verify_peer(false).build().unwrap();
        let server = TlsConfig::server().build().unwrap();
        (client.provider().unwrap(), server.provider().unwrap())
    }

    #[test]
    fn test_complete_record_len() {
        assert_eq!(complete_record_len(&[22, 3, 3]).unwrap(), None);
        assert_eq!(complete_record_len(&[22, 3, 3, 0, 2, 1]).unwrap(), None);
        assert_eq!(complete_record_len(&[22, 3, 3, 0, 2, 1, 2, 9]).unwrap(), Some(7));
        assert!(complete_record_len(&[23, 3, 3, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_server_waits_without_input() {
        let (_, mut server) = pair();
        let mut out = StreamBuffer::new();
        let step = server.negotiate(&[], &mut out).unwrap();
        assert_eq!(step.status, NegotiateStatus::IncompleteMessage);
        assert!(out.is_empty());
    }

    #[test]
    fn test_client_hello_then_partial_record() {
        let (mut client, mut server) = pair();
        let mut hello = StreamBuffer::new();
        let step = client.negotiate(&[], &mut hello).unwrap();
        assert_eq!(step.status, NegotiateStatus::ContinueNeeded);
        assert!(!hello.is_empty());

        // Half a record is not fed to OpenSSL at all.
        let half = &hello.as_slice()[..hello.len() / 2];
        let mut out = StreamBuffer::new();
        server.negotiate(&[], &mut out).unwrap();
        let step = server.negotiate(half, &mut out).unwrap();
        assert_eq!(step.status, NegotiateStatus::IncompleteMessage);
        assert_eq!(step.extra, half.len());
        assert!(out.is_empty());
    }

    #[test]
    fn test_in_memory_handshake_and_record() {
        let (mut client, mut server) = pair();
        let mut to_server = StreamBuffer::new();
        let mut to_client = StreamBuffer::new();

        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..10 {
            if !client_done {
                let input = to_client.as_slice().to_vec();
                to_client.clear();
                client_done = client.negotiate(&input, &mut to_server).unwrap().status
                    == NegotiateStatus::Complete;
            }
            if !server_done {
                let input = to_server.as_slice().to_vec();
                to_server.clear();
                server_done = server.negotiate(&input, &mut to_client).unwrap().status
                    == NegotiateStatus::Complete;
            }
            if client_done && server_done {
                break;
            }
        }
        assert!(client_done && server_done);
        assert!(client.info().unwrap().version.starts_with("TLS"));

        let sizes = client.stream_sizes().unwrap();
        let mut record = vec![0u8; sizes.record_len(5)];
        record[sizes.header..sizes.header + 5].copy_from_slice(b"hello");
        let trailer = client.encrypt(&mut record, &sizes, 5).unwrap();
        record.truncate(sizes.header + 5 + trailer);

        // Drain post-handshake records the server emitted toward the client.
        let pending = to_client.as_slice().to_vec();
        let mut sink = StreamBuffer::new();
        let mut rest = &pending[..];
        while !rest.is_empty() {
            let step = client.decrypt(rest, &mut sink).unwrap();
            rest = &rest[step.consumed(rest.len())..];
        }

        let mut plain = StreamBuffer::new();
        let step = server.decrypt(&record, &mut plain).unwrap();
        assert_eq!(step.status, DecryptStatus::Ok);
        assert_eq!(step.extra, 0);
        assert_eq!(plain.as_slice(), b"hello");
    }

    #[test]
    fn test_stream_sizes_before_negotiation() {
        let (mut client, _) = pair();
        assert!(matches!(
            client.stream_sizes(),
            Err(ProviderError::NotNegotiated)
        ));
    }

    #[test]
    fn test_peer_name_after_start_rejected() {
        let (mut client, _) = pair();
        client.set_peer_name("example.com").unwrap();
        let mut out = StreamBuffer::new();
        client.negotiate(&[], &mut out).unwrap();
        assert!(client.set_peer_name("other.example").is_err());
    }
}
