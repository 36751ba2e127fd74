//! OpenSSL configuration and the native-library session
//!
//! `TlsConfig` is the single entry point for creating sessions: it holds
//! the OpenSSL context and role, and hands out either backend shape.
//!
//! # Examples
//!
//! ```no_run
//! use nbtls::session::{MemoryPipe, PipeEnd, Session};
//! use nbtls::tls::{TlsConfig, TlsVersion};
//!
//! let config = TlsConfig::client()
//!     .version(TlsVersion::Tls13)
//!     .servername("example.com")
//!     .verify_peer(true)
//!     .build()
//!     .unwrap();
//!
//! let (near, _far) = MemoryPipe::pair();
//! let mut session = config.record_session::<PipeEnd>().unwrap();
//! session.set_transport(near).unwrap();
//! let _ = session.handshake();
//! ```

pub mod builtin_cert;
pub mod cert;
pub mod config;
pub mod info;
pub mod native;

pub use cert::CertInfo;
pub use config::{
    ClientConfigBuilder, ClientVerify, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion,
};
pub use info::SessionInfo;
pub use native::{CallbackIo, NativeSession};

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, TlsError>;
