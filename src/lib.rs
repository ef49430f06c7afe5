//! qtls - TLS session setup and peer verification for QUIC transports
//!
//! This crate establishes and verifies the TLS side of a QUIC connection,
//! hiding the differences between cryptographic backends behind one
//! deterministic lifecycle. The QUIC transport above it drives the actual
//! handshake byte exchange; this crate only orchestrates setup, trust
//! establishment and verification ordering.
//!
//! # Architecture
//!
//! Every backend implements the same four operations behind the
//! [`TlsBackend`] trait, selected per build configuration and dispatched
//! statically:
//!
//! 1. [`TlsContext::build`] creates a TLS 1.3 client context from a
//!    [`ConnectionConfig`] (ciphers, groups, CA material, verify flags).
//! 2. [`TlsContext::init_session`] binds one session to it (client role,
//!    ALPN, SNI, opaque user data).
//! 3. [`TlsContext::ensure_trust_ready`] finalizes the trust store, once,
//!    right before the first read of inbound handshake data.
//! 4. [`TlsContext::verify_peer`] turns the handshake result into a single
//!    pass/fail verdict (chain, hostname, pinned key).
//!
//! [`TlsContext::cleanup`] is safe from any state, including mid-failure,
//! and is a no-op when repeated.
//!
//! # Examples
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::sync::Arc;
//! use qtls::{ConnectionConfig, PeerDescriptor, TlsContext};
//! use qtls::backend::DefaultBackend;
//!
//! let config = Arc::new(
//!     ConnectionConfig::builder()
//!         .ca_file("/etc/ssl/certs/ca-certificates.crt")
//!         .build(),
//! );
//! let peer = PeerDescriptor::new("example.com");
//!
//! let mut tls = TlsContext::<DefaultBackend>::new();
//! tls.build(config, None).unwrap();
//! tls.init_session(&peer, Some(&["h3"]), None).unwrap();
//! tls.ensure_trust_ready().unwrap();
//!
//! // The QUIC transport drives the handshake over its own byte stream.
//! let transport = TcpStream::connect("example.com:443").unwrap();
//! tls.session_mut().unwrap().connect(Box::new(transport)).unwrap();
//!
//! tls.verify_peer().unwrap();
//! tls.cleanup();
//! ```
//!
//! # Keylog export
//!
//! When [`keylog`] is enabled (via `SSLKEYLOGFILE` or [`keylog::open_at`]),
//! every context registers a secret export callback writing NSS-format lines
//! to the shared, process-wide keylog file. A backend compiled without
//! export support refuses to build a context in that case rather than
//! silently not logging.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod keylog;
pub mod verify;

pub use backend::{TlsBackend, Transport};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, PeerDescriptor};
pub use config::{QUIC_CIPHERS, QUIC_GROUPS};
pub use context::{TlsContext, TrustState};
pub use error::{Error, Result, VerificationError};

#[cfg(feature = "openssl-backend")]
pub use backend::openssl::OpensslBackend;

#[cfg(feature = "rustls-backend")]
pub use backend::rustls::RustlsBackend;

#[cfg(feature = "boring-backend")]
pub use backend::boring::BoringBackend;
