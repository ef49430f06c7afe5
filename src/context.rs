//! Per-connection TLS lifecycle.
//!
//! A [`TlsContext`] walks one QUIC connection attempt through the fixed
//! progression: build context, init session, (collaborator-driven handshake
//! I/O), trust setup before the first handshake read, peer verification after
//! handshake success. Cleanup is legal from any state, including after a
//! partial failure, and is a no-op when repeated.
//!
//! The context is owned by exactly one connection attempt and is never
//! touched from more than one thread of control; no locking happens here.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{ContextCustomizer, TlsBackend};
use crate::config::{encode_alpn, ConnectionConfig, PeerDescriptor};
use crate::error::{Error, Result, VerificationError};
use crate::keylog;

/// Whether the deferred trust setup has run for this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    NotReady,
    Ready,
}

struct Inner<B: TlsBackend> {
    // Declared before `ctx`: fields drop in declaration order and the
    // session must never outlive its context.
    session: Option<B::Session>,
    ctx: B::Context,
    config: Arc<ConnectionConfig>,
    peer: Option<PeerDescriptor>,
    trust: TrustState,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

/// TLS state for one QUIC connection attempt.
///
/// Created empty; populated by [`build`](TlsContext::build) and
/// [`init_session`](TlsContext::init_session); reset to empty by
/// [`cleanup`](TlsContext::cleanup). Misordered calls (building twice,
/// initializing a second session) are caller bugs and panic rather than
/// returning a recoverable error.
pub struct TlsContext<B: TlsBackend> {
    inner: Option<Inner<B>>,
}

impl<B: TlsBackend> Default for TlsContext<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TlsBackend> TlsContext<B> {
    /// A context in its empty state.
    pub fn new() -> Self {
        TlsContext { inner: None }
    }

    /// True until [`build`](TlsContext::build) succeeds or after
    /// [`cleanup`](TlsContext::cleanup).
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Build the backend context for TLS 1.3 client use.
    ///
    /// If keylog export is enabled for the process (the shared keylog file is
    /// opened here if `SSLKEYLOGFILE` names one) and the backend cannot
    /// export secrets, this fails with [`Error::KeylogUnsupported`] instead
    /// of silently not logging. On any failure the partial context is
    /// dropped; the `TlsContext` stays empty.
    pub fn build(
        &mut self,
        config: Arc<ConnectionConfig>,
        customize: Option<&ContextCustomizer<B>>,
    ) -> Result<()> {
        assert!(
            self.inner.is_none(),
            "build called on a non-empty TlsContext"
        );
        if keylog::open() && !B::SUPPORTS_KEYLOG {
            return Err(Error::KeylogUnsupported(B::NAME));
        }
        let ctx = B::build_context(&config, customize)?;
        debug!(backend = B::NAME, "TLS context built");
        self.inner = Some(Inner {
            session: None,
            ctx,
            config,
            peer: None,
            trust: TrustState::NotReady,
            user_data: None,
        });
        Ok(())
    }

    /// Create the connection's session: client role, legacy QUIC
    /// compatibility paths disabled, `alpn` and the peer's SNI applied when
    /// present. `user_data` is an opaque handle the QUIC collaborator can
    /// read back to correlate callbacks.
    pub fn init_session(
        &mut self,
        peer: &PeerDescriptor,
        alpn: Option<&[&str]>,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        let inner = self
            .inner
            .as_mut()
            .expect("init_session called before build");
        assert!(
            inner.session.is_none(),
            "init_session called twice on one TlsContext"
        );
        let alpn_wire = alpn.map(encode_alpn);
        let session = B::init_session(&mut inner.ctx, &inner.config, peer, alpn_wire.as_deref())?;
        debug!(backend = B::NAME, sni = ?peer.sni(), "TLS session initialized");
        inner.session = Some(session);
        inner.peer = Some(peer.clone());
        inner.user_data = user_data;
        Ok(())
    }

    /// Finalize the trust store for this context.
    ///
    /// Callable any number of times; performs real work at most once. The
    /// QUIC collaborator calls this immediately before its first attempt to
    /// read inbound handshake data, since some backends cannot finalize trust
    /// until the session exists.
    pub fn ensure_trust_ready(&mut self) -> Result<()> {
        let inner = self
            .inner
            .as_mut()
            .expect("ensure_trust_ready called before build");
        if inner.trust == TrustState::Ready {
            return Ok(());
        }
        let session = inner
            .session
            .as_mut()
            .expect("ensure_trust_ready called before init_session");
        B::setup_trust(&mut inner.ctx, session, &inner.config)?;
        inner.trust = TrustState::Ready;
        Ok(())
    }

    /// Current trust state.
    pub fn trust_state(&self) -> TrustState {
        match &self.inner {
            Some(inner) => inner.trust,
            None => TrustState::NotReady,
        }
    }

    /// Single post-handshake verdict on the peer.
    ///
    /// Called once after the handshake has produced a peer certificate; the
    /// collaborator enforces that ordering. Host verification uses the
    /// hostname recorded at session-initialization time: if host verification
    /// is on and no hostname was recorded, the verdict is deterministically
    /// [`VerificationError::NoSniForVerification`].
    pub fn verify_peer(&self) -> std::result::Result<(), VerificationError> {
        let inner = self.inner.as_ref().expect("verify_peer called before build");
        let session = inner
            .session
            .as_ref()
            .expect("verify_peer called before init_session");
        let sni = inner.peer.as_ref().and_then(|p| p.sni());
        if inner.config.verify_host && sni.is_none() {
            return Err(VerificationError::NoSniForVerification);
        }
        B::verify_peer(&inner.ctx, session, &inner.config, sni)
    }

    /// The backend session handle, for the QUIC collaborator to drive
    /// handshake byte exchange over.
    pub fn session(&self) -> Option<&B::Session> {
        self.inner.as_ref().and_then(|i| i.session.as_ref())
    }

    /// Mutable access to the backend session handle.
    pub fn session_mut(&mut self) -> Option<&mut B::Session> {
        self.inner.as_mut().and_then(|i| i.session.as_mut())
    }

    /// The opaque user data supplied at session initialization.
    pub fn user_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.inner.as_ref().and_then(|i| i.user_data.as_ref())
    }

    /// Release the session (first) and the backend context and return to the
    /// empty state. Safe from any state, including mid-construction ones;
    /// calling it again is a no-op.
    pub fn cleanup(&mut self) {
        self.inner = None;
    }
}
