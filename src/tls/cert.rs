//! Peer certificate summary

use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref};
use std::net::IpAddr;

/// Subject, issuer and alternative names of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// `DNS:` and `IP:` prefixed alternative names
    pub subject_alt_names: Vec<String>,
    /// Expiry as printed by OpenSSL
    pub not_after: String,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: alt_names(cert),
            not_after: cert.not_after().to_string(),
        }
    }

    /// Whether `name` appears among the DNS alternative names, honoring a
    /// single leading wildcard label
    pub fn matches_dns_name(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.subject_alt_names
            .iter()
            .filter_map(|san| san.strip_prefix("DNS:"))
            .any(|pattern| {
                let pattern = pattern.to_ascii_lowercase();
                match pattern.strip_prefix("*.") {
                    Some(suffix) => name
                        .split_once('.')
                        .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
                    None => pattern == name,
                }
            })
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(sans) = cert.subject_alt_names() else {
        return Vec::new();
    };
    sans.iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            let ip = name.ipaddress()?;
            let addr = match ip.len() {
                4 => IpAddr::from(<[u8; 4]>::try_from(ip).ok()?),
                16 => IpAddr::from(<[u8; 16]>::try_from(ip).ok()?),
                _ => return None,
            };
            Some(format!("IP:{}", addr))
        })
        .collect()
}

/// Peer certificate followed by the rest of the chain the peer sent
pub fn peer_chain(ssl: &SslRef) -> Vec<CertInfo> {
    let mut chain = Vec::new();
    let peer = ssl.peer_certificate();
    if let Some(cert) = &peer {
        chain.push(CertInfo::from_x509(cert));
    }
    if let Some(stack) = ssl.peer_cert_chain() {
        for cert in stack {
            // Servers report the leaf again at the head of the chain.
            let duplicate = peer
                .as_ref()
                .and_then(|p| p.to_der().ok())
                .zip(cert.to_der().ok())
                .is_some_and(|(a, b)| a == b);
            if !duplicate {
                chain.push(CertInfo::from_x509(cert));
            }
        }
    }
    chain
}
