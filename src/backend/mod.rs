//! Backend capability set.
//!
//! Each supported TLS library implements [`TlsBackend`]: the same four
//! lifecycle operations over its own context and session handle types.
//! Backends are selected at build configuration time through cargo features
//! and dispatched statically; [`DefaultBackend`] names the preferred variant
//! among those compiled in.
//!
//! Backend divergence that cannot be papered over is expressed as a
//! capability constant rather than silently degraded behavior: a backend
//! without a secret export callback sets [`TlsBackend::SUPPORTS_KEYLOG`] to
//! `false` and keylog-enabled runs refuse it up front.

use std::io;

use crate::config::{ConnectionConfig, PeerDescriptor};
use crate::error::{Error, VerificationError};

#[cfg(feature = "boring-backend")]
pub mod boring;
#[cfg(feature = "openssl-backend")]
pub mod openssl;
#[cfg(feature = "rustls-backend")]
pub mod rustls;

/// Application hook run against the backend's context builder before the
/// context is finalized. Returning an error aborts construction.
pub type ContextCustomizer<B> =
    dyn Fn(&mut <B as TlsBackend>::ContextBuilder) -> Result<(), Error> + Send + Sync;

/// The byte transport a session's handshake is driven over. The QUIC
/// collaborator supplies one; this crate performs no I/O of its own beyond
/// what the collaborator pushes through it. `Debug` is required so handshake
/// failures can name the transport they happened on.
pub trait Transport: io::Read + io::Write + std::fmt::Debug + Send {}

impl<T: io::Read + io::Write + std::fmt::Debug + Send> Transport for T {}

/// One TLS library behind the common lifecycle contract.
pub trait TlsBackend: Sized {
    /// Human-readable backend name for diagnostics.
    const NAME: &'static str;

    /// Whether the backend can export per-session secrets to the keylog.
    const SUPPORTS_KEYLOG: bool;

    /// The backend context handle: per-config state shared by the session.
    type Context;

    /// The under-construction context exposed to [`ContextCustomizer`].
    type ContextBuilder;

    /// The per-connection session handle driven by the QUIC collaborator.
    type Session;

    /// Build a TLS 1.3 client context from `config`. On any failure the
    /// partially built context is dropped before the error is returned.
    fn build_context(
        config: &ConnectionConfig,
        customize: Option<&ContextCustomizer<Self>>,
    ) -> Result<Self::Context, Error>;

    /// Create the connection's session: client role, QUIC legacy paths off,
    /// ALPN (length-prefixed wire format) and SNI applied when present.
    fn init_session(
        ctx: &mut Self::Context,
        config: &ConnectionConfig,
        peer: &PeerDescriptor,
        alpn_wire: Option<&[u8]>,
    ) -> Result<Self::Session, Error>;

    /// Finalize the trust store. Invoked exactly once per context, right
    /// before the first read of inbound handshake data; the caller tracks
    /// idempotency.
    fn setup_trust(
        ctx: &mut Self::Context,
        session: &mut Self::Session,
        config: &ConnectionConfig,
    ) -> Result<(), Error>;

    /// Post-handshake verdict on the peer certificate: chain validity when
    /// `verify_peer`, hostname coverage of `sni` when `verify_host`, and the
    /// pinned-key comparison when a pin is configured.
    fn verify_peer(
        ctx: &Self::Context,
        session: &Self::Session,
        config: &ConnectionConfig,
        sni: Option<&str>,
    ) -> Result<(), VerificationError>;
}

/// The preferred backend among those compiled in.
#[cfg(feature = "openssl-backend")]
pub type DefaultBackend = openssl::OpensslBackend;

#[cfg(all(feature = "rustls-backend", not(feature = "openssl-backend")))]
pub type DefaultBackend = rustls::RustlsBackend;

#[cfg(all(
    feature = "boring-backend",
    not(any(feature = "openssl-backend", feature = "rustls-backend"))
))]
pub type DefaultBackend = boring::BoringBackend;
