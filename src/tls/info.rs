//! Negotiated session parameters
//!
//! Populated from the OpenSSL connection once the handshake has run; the
//! values are what the peers actually agreed on, not what was configured.

use super::cert::{peer_chain, CertInfo};
use openssl::ssl::{NameType, SslRef};

/// Snapshot of a TLS connection's negotiated parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Protocol version, e.g. "TLSv1.3"
    pub version: String,
    /// Cipher suite name
    pub cipher: Option<String>,
    /// Server name sent (client) or received (server) via SNI
    pub servername: Option<String>,
    /// ALPN protocol selected by the server
    pub alpn: Option<String>,
    pub session_reused: bool,
    /// Certificate verification outcome as reported by OpenSSL
    pub verify_result: String,
    /// Peer certificate first, then the rest of its chain
    pub peer_chain: Vec<CertInfo>,
}

impl SessionInfo {
    pub fn from_ssl(ssl: &SslRef) -> Self {
        SessionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            session_reused: ssl.session_reused(),
            verify_result: ssl.verify_result().to_string(),
            peer_chain: peer_chain(ssl),
        }
    }

    /// The peer's own certificate, if it sent one
    pub fn peer_certificate(&self) -> Option<&CertInfo> {
        self.peer_chain.first()
    }
}
