//! TLS configuration
//!
//! Client and server builders over an OpenSSL context. Setters never fail
//! on their own: the first error is kept and reported by `build()`.

use super::native::NativeSession;
use crate::channel::{OpensslProvider, RecordSession};
use crate::session::{Session, SessionLimits, TransportAdapter};
use openssl::pkey::PKey;
use openssl::ssl::{
    AlpnError, Ssl, SslContext, SslContextBuilder, SslMethod, SslMode,
    SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use std::path::Path;
use std::str::FromStr;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse "TLSv1.2", "tls1.3", "TLSv1" and similar spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// Client certificate verification mode (server side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerify {
    /// Don't request client certificates
    None,
    /// Request a certificate and verify it if sent
    Optional,
    /// Fail the handshake without a valid client certificate
    Required,
}

/// TLS configuration errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Immutable TLS configuration shared by every session created from it
#[derive(Clone)]
pub struct TlsConfig {
    ctx: SslContext,
    is_server: bool,
    servername: Option<String>,
    verify_peer: bool,
    limits: SessionLimits,
}

impl TlsConfig {
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Default peer name applied to new client sessions
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn context(&self) -> &SslContext {
        &self.ctx
    }

    /// New OpenSSL connection object for this configuration
    pub fn new_ssl(&self) -> Result<Ssl, TlsError> {
        Ok(Ssl::new(&self.ctx)?)
    }

    /// Record-granular provider with the configured role
    pub fn provider(&self) -> Result<OpensslProvider, TlsError> {
        let ssl = self.new_ssl()?;
        Ok(if self.is_server {
            OpensslProvider::server(ssl)
        } else {
            OpensslProvider::client(ssl)
        })
    }

    /// Session driven by the record-buffering engine
    pub fn record_session<T: TransportAdapter>(
        &self,
    ) -> Result<RecordSession<OpensslProvider, T>, TlsError> {
        let mut session = RecordSession::with_limits(self.provider()?, self.limits);
        self.apply_servername(&mut session)?;
        Ok(session)
    }

    /// Session driven by OpenSSL's own record layer
    pub fn native_session<T: TransportAdapter>(&self) -> Result<NativeSession<T>, TlsError> {
        let ssl = self.new_ssl()?;
        let mut session = if self.is_server {
            NativeSession::server(ssl)
        } else {
            NativeSession::client(ssl)
        };
        self.apply_servername(&mut session)?;
        Ok(session)
    }

    fn apply_servername<S: Session>(&self, session: &mut S) -> Result<(), TlsError> {
        if let (false, Some(name)) = (self.is_server, &self.servername) {
            session
                .set_peer_name(name)
                .map_err(|e| TlsError::InvalidConfig(format!("server name {}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Encode protocol names in ALPN wire format
fn alpn_wire(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(TlsError::InvalidConfig(format!(
                "invalid ALPN protocol name {:?}",
                proto
            )));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// First protocol in server preference order that the client also offered
///
/// The match is returned as a slice of the client's wire-format list, which
/// is the lifetime OpenSSL's select callback requires.
fn select_alpn<'a>(accepted: &[Vec<u8>], client: &'a [u8]) -> Option<&'a [u8]> {
    accepted.iter().find_map(|proto| {
        let mut pos = 0;
        while pos < client.len() {
            let len = client[pos] as usize;
            pos += 1;
            let offered = client.get(pos..pos + len)?;
            if offered == proto.as_slice() {
                return Some(offered);
            }
            pos += len;
        }
        None
    })
}

/// Context builder that remembers its first failure
struct ContextBuilder {
    inner: Result<SslContextBuilder, TlsError>,
    has_cert: bool,
}

impl ContextBuilder {
    fn new(method: SslMethod) -> Self {
        let inner = SslContextBuilder::new(method)
            .map(|mut builder| {
                // Callers retry with the same bytes from a possibly moved buffer.
                builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE | SslMode::ACCEPT_MOVING_WRITE_BUFFER);
                builder
            })
            .map_err(TlsError::from);
        ContextBuilder {
            inner,
            has_cert: false,
        }
    }

    fn apply<F>(&mut self, f: F)
    where
        F: FnOnce(&mut SslContextBuilder) -> Result<(), TlsError>,
    {
        if let Ok(builder) = &mut self.inner {
            if let Err(e) = f(builder) {
                log::debug!("TLS configuration rejected: {}", e);
                self.inner = Err(e);
            }
        }
    }

    fn version_range(&mut self, min: TlsVersion, max: TlsVersion) {
        self.apply(|b| {
            if min > max {
                return Err(TlsError::InvalidConfig(format!(
                    "minimum version {} above maximum {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
            b.set_min_proto_version(Some(min.to_openssl_version()))?;
            b.set_max_proto_version(Some(max.to_openssl_version()))?;
            Ok(())
        });
    }

    fn cipher_list(&mut self, ciphers: &str) {
        self.apply(|b| Ok(b.set_cipher_list(ciphers)?));
    }

    fn ciphersuites(&mut self, ciphers: &str) {
        self.apply(|b| Ok(b.set_ciphersuites(ciphers)?));
    }

    /// Load a certificate and its private key from one PEM bundle
    fn cert_pem(&mut self, pem: &[u8]) {
        self.apply(|b| {
            let cert = X509::from_pem(pem)
                .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
            let key = PKey::private_key_from_pem(pem)
                .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
            b.set_certificate(&cert)?;
            b.set_private_key(&key)?;
            b.check_private_key()
                .map_err(|e| TlsError::Certificate(format!("Key does not match certificate: {}", e)))
        });
        self.has_cert = true;
    }

    fn cert_file(&mut self, path: &Path) {
        match std::fs::read(path) {
            Ok(pem) => self.cert_pem(&pem),
            Err(e) => self.apply(|_| Err(e.into())),
        }
    }

    fn ca_file(&mut self, path: &Path) {
        self.apply(|b| Ok(b.set_ca_file(path)?));
    }

    fn build(self) -> Result<SslContext, TlsError> {
        Ok(self.inner?.build())
    }
}

/// Builder for connecting-side configurations
pub struct ClientConfigBuilder {
    ctx: ContextBuilder,
    servername: Option<String>,
    verify_peer: bool,
    limits: SessionLimits,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        let mut ctx = ContextBuilder::new(SslMethod::tls_client());
        ctx.apply(|b| {
            b.set_verify(SslVerifyMode::NONE);
            Ok(())
        });
        ClientConfigBuilder {
            ctx,
            servername: None,
            verify_peer: false,
            limits: SessionLimits::default(),
        }
    }

    /// Pin a single protocol version
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.ctx.version_range(min, max);
        self
    }

    /// Cipher list for TLS 1.2 and below
    pub fn cipher_list(mut self, ciphers: &str) -> Self {
        self.ctx.cipher_list(ciphers);
        self
    }

    /// Cipher suites for TLS 1.3
    pub fn ciphersuites(mut self, ciphers: &str) -> Self {
        self.ctx.ciphersuites(ciphers);
        self
    }

    /// Protocols offered through ALPN, in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        let wire = alpn_wire(protocols);
        self.ctx.apply(|b| Ok(b.set_alpn_protos(&wire?)?));
        self
    }

    /// Default peer name for SNI and certificate name checks
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Verify the server certificate chain and name
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self.ctx.apply(|b| {
            if verify {
                b.set_verify(SslVerifyMode::PEER);
                b.set_default_verify_paths()?;
            } else {
                b.set_verify(SslVerifyMode::NONE);
            }
            Ok(())
        });
        self
    }

    /// Trust anchors used when verifying the server
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ctx.ca_file(path.as_ref());
        self
    }

    /// Client certificate and key, PEM encoded in one file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ctx.cert_file(path.as_ref());
        self
    }

    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx.build()?,
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
            limits: self.limits,
        })
    }
}

/// Builder for accepting-side configurations
pub struct ServerConfigBuilder {
    ctx: ContextBuilder,
    limits: SessionLimits,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        ServerConfigBuilder {
            ctx: ContextBuilder::new(SslMethod::tls_server()),
            limits: SessionLimits::default(),
        }
    }

    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.ctx.version_range(min, max);
        self
    }

    pub fn cipher_list(mut self, ciphers: &str) -> Self {
        self.ctx.cipher_list(ciphers);
        self
    }

    pub fn ciphersuites(mut self, ciphers: &str) -> Self {
        self.ctx.ciphersuites(ciphers);
        self
    }

    /// Protocols the server accepts, in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        if let Err(e) = alpn_wire(protocols) {
            self.ctx.apply(|_| Err(e));
            return self;
        }
        let accepted: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.ctx.apply(|b| {
            b.set_alpn_select_callback(move |_ssl, client| {
                select_alpn(&accepted, client).ok_or(AlpnError::NOACK)
            });
            Ok(())
        });
        self
    }

    /// Server certificate and key, PEM encoded in one file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ctx.cert_file(path.as_ref());
        self
    }

    /// Server certificate and key from an in-memory PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Self {
        self.ctx.cert_pem(pem);
        self
    }

    pub fn client_verify(mut self, mode: ClientVerify) -> Self {
        let verify_mode = match mode {
            ClientVerify::None => SslVerifyMode::NONE,
            ClientVerify::Optional => SslVerifyMode::PEER,
            ClientVerify::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        };
        self.ctx.apply(|b| {
            b.set_verify(verify_mode);
            Ok(())
        });
        self
    }

    /// Trust anchors used when verifying client certificates
    pub fn client_verify_ca<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ctx.ca_file(path.as_ref());
        self
    }

    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build, falling back to the built-in certificate when none was loaded
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if !self.ctx.has_cert {
            self.ctx
                .cert_pem(super::builtin_cert::BUILTIN_CERT.as_bytes());
        }
        Ok(TlsConfig {
            ctx: self.ctx.build()?,
            is_server: true,
            servername: None,
            verify_peer: false,
            limits: self.limits,
        })
    }
}
