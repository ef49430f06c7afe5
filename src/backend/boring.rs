//! BoringSSL backend.
//!
//! BoringSSL pins its own TLS 1.3 cipher-suite and group preferences and
//! offers no secret export callback, so this variant advertises
//! `SUPPORTS_KEYLOG = false` (keylog-enabled runs are refused up front) and
//! rejects explicit suite/group overrides instead of silently ignoring them.
//! Since ALPN is only configurable on the context, the context handle stays
//! a builder until the session is initialized; one context serves exactly
//! one session either way.

use std::io::{self, Read, Write};
use std::net::IpAddr;

use boring::hash::MessageDigest;
use boring::nid::Nid;
use boring::ssl::{Ssl, SslContextBuilder, SslMethod, SslStream, SslVerifyMode, SslVersion};
use boring::x509::{X509Ref, X509VerifyResult};
use tracing::{debug, info, warn};

use super::{ContextCustomizer, TlsBackend, Transport};
use crate::config::{ConnectionConfig, PeerDescriptor};
use crate::error::{Error, VerificationError};
use crate::verify::{cert_covers_host, pin_matches, SubjectAltName};

/// Backend context. The underlying `SSL_CTX` is finalized lazily when the
/// session is created, once the ALPN list is known.
pub struct BoringContext {
    builder: Option<SslContextBuilder>,
}

enum SessionState {
    Pending(Ssl),
    Active(SslStream<Box<dyn Transport>>),
    Failed,
}

/// Backend session, driven over a collaborator-supplied [`Transport`].
pub struct BoringSession {
    state: SessionState,
}

impl BoringSession {
    /// Attach the collaborator's byte transport and run the TLS handshake
    /// over it in the client role.
    pub fn connect(&mut self, transport: Box<dyn Transport>) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, SessionState::Failed) {
            SessionState::Pending(ssl) => {
                let stream = ssl
                    .connect(transport)
                    .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
                self.state = SessionState::Active(stream);
                Ok(())
            }
            SessionState::Active(_) => panic!("connect called twice on one session"),
            SessionState::Failed => Err(Error::Backend("connect on a failed session".to_string())),
        }
    }

    /// The negotiated ALPN protocol, once the handshake completed.
    pub fn selected_alpn(&self) -> Option<&[u8]> {
        self.ssl().and_then(|ssl| ssl.selected_alpn_protocol())
    }

    fn ssl(&self) -> Option<&boring::ssl::SslRef> {
        match &self.state {
            SessionState::Pending(ssl) => Some(ssl),
            SessionState::Active(stream) => Some(stream.ssl()),
            SessionState::Failed => None,
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut SslStream<Box<dyn Transport>>> {
        match &mut self.state {
            SessionState::Active(stream) => Ok(stream),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "TLS session has no active transport",
            )),
        }
    }
}

impl Read for BoringSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl Write for BoringSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}

/// The BoringSSL implementation of the backend capability set.
pub struct BoringBackend;

impl TlsBackend for BoringBackend {
    const NAME: &'static str = "BoringSSL";
    const SUPPORTS_KEYLOG: bool = false;
    type Context = BoringContext;
    type ContextBuilder = SslContextBuilder;
    type Session = BoringSession;

    fn build_context(
        config: &ConnectionConfig,
        customize: Option<&ContextCustomizer<Self>>,
    ) -> Result<Self::Context, Error> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())
            .map_err(|e| Error::Backend(e.to_string()))?;
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::Backend(e.to_string()))?;

        if let Some(cb) = customize {
            cb(&mut builder)?;
        }

        if builder.set_default_verify_paths().is_err() {
            warn!("failed to load default verify paths");
        }

        // BoringSSL orders its TLS 1.3 suites and groups internally; an
        // explicit override cannot be applied and must not be dropped
        // silently.
        if config.cipher_list13.is_some() {
            return Err(Error::BadCipherConfig(
                "TLS 1.3 cipher suites are not configurable with this backend".to_string(),
            ));
        }
        if config.curves.is_some() {
            return Err(Error::BadGroupConfig(
                "key-exchange groups are not configurable with this backend".to_string(),
            ));
        }

        if config.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
            if let Some(file) = &config.ca_file {
                builder.set_ca_file(file).map_err(|e| Error::CaLoadFailed {
                    ca_file: config.ca_file.clone(),
                    ca_path: config.ca_path.clone(),
                    detail: e.to_string(),
                })?;
                info!(ca_file = %file.display(), "CA file loaded");
            } else if config.ca_path.is_some() {
                return Err(Error::CaLoadFailed {
                    ca_file: None,
                    ca_path: config.ca_path.clone(),
                    detail: "CA directories are not supported with this backend".to_string(),
                });
            } else {
                #[cfg(feature = "ca-fallback")]
                {
                    let _ = builder.set_default_verify_paths();
                }
                #[cfg(not(feature = "ca-fallback"))]
                warn!("peer verification enabled with no CA material configured");
            }
        } else {
            // Deliberate opt-out: any certificate is accepted.
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(BoringContext {
            builder: Some(builder),
        })
    }

    fn init_session(
        ctx: &mut Self::Context,
        _config: &ConnectionConfig,
        peer: &PeerDescriptor,
        alpn_wire: Option<&[u8]>,
    ) -> Result<Self::Session, Error> {
        let mut builder = ctx
            .builder
            .take()
            .expect("init_session called twice on one context");
        if let Some(wire) = alpn_wire {
            builder
                .set_alpn_protos(wire)
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        let ssl_ctx = builder.build();

        let mut ssl = Ssl::new(&ssl_ctx).map_err(|_| Error::OutOfMemory("session"))?;
        if let Some(host) = peer.sni() {
            ssl.set_hostname(host)
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(BoringSession {
            state: SessionState::Pending(ssl),
        })
    }

    fn setup_trust(
        _ctx: &mut Self::Context,
        _session: &mut Self::Session,
        _config: &ConnectionConfig,
    ) -> Result<(), Error> {
        debug!("trust store already finalized at context build");
        Ok(())
    }

    fn verify_peer(
        _ctx: &Self::Context,
        session: &Self::Session,
        config: &ConnectionConfig,
        sni: Option<&str>,
    ) -> Result<(), VerificationError> {
        let ssl = session
            .ssl()
            .ok_or_else(|| VerificationError::ChainInvalid("session failed".to_string()))?;

        if config.verify_peer && ssl.verify_result() != X509VerifyResult::OK {
            return Err(VerificationError::ChainInvalid(
                ssl.verify_result().error_string().to_string(),
            ));
        }

        let needs_cert =
            config.verify_host || config.pinned_pubkey.is_some() || config.verify_peer;
        let cert = match ssl.peer_certificate() {
            Some(cert) => cert,
            None if needs_cert => {
                return Err(VerificationError::ChainInvalid(
                    "no peer certificate".to_string(),
                ))
            }
            None => return Ok(()),
        };

        if config.verify_host {
            let host = sni.ok_or(VerificationError::NoSniForVerification)?;
            let (cn, sans) = subject_names(&cert);
            if !cert_covers_host(host, cn.as_deref(), &sans) {
                return Err(VerificationError::HostMismatch(host.to_string()));
            }
        }

        if let Some(pins) = &config.pinned_pubkey {
            let digest = spki_sha256(&cert)
                .map_err(|e| VerificationError::ChainInvalid(e.to_string()))?;
            if !pin_matches(pins, &digest) {
                return Err(VerificationError::PinMismatch);
            }
        }

        info!("peer verified");
        Ok(())
    }
}

fn spki_sha256(cert: &X509Ref) -> Result<Vec<u8>, boring::error::ErrorStack> {
    let spki = cert.public_key()?.public_key_to_der()?;
    Ok(boring::hash::hash(MessageDigest::sha256(), &spki)?.to_vec())
}

fn subject_names(cert: &X509Ref) -> (Option<String>, Vec<SubjectAltName>) {
    let cn = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string());

    let mut sans = Vec::new();
    if let Some(names) = cert.subject_alt_names() {
        for name in names {
            if let Some(dns) = name.dnsname() {
                sans.push(SubjectAltName::Dns(dns.to_string()));
            } else if let Some(ip) = name.ipaddress() {
                if let Some(addr) = ip_from_der(ip) {
                    sans.push(SubjectAltName::Ip(addr));
                }
            }
        }
    }
    (cn, sans)
}

fn ip_from_der(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
