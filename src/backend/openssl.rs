//! OpenSSL-style backend.
//!
//! Contexts are `SSL_CTX` wrappers restricted to TLS 1.3 client use;
//! sessions are `SSL` handles that the QUIC collaborator drives over any
//! [`Transport`] via [`OsslSession::connect`]. Chain verification happens
//! during the handshake (when enabled); hostname and pin checks happen in
//! [`TlsBackend::verify_peer`] so the caller gets one tagged verdict.

use std::io::{self, Read, Write};
use std::net::IpAddr;

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream, SslVerifyMode,
    SslVersion,
};
use openssl::x509::{X509Ref, X509VerifyResult};
use tracing::{debug, info, warn};

use super::{ContextCustomizer, TlsBackend, Transport};
use crate::config::{ConnectionConfig, PeerDescriptor};
use crate::error::{Error, VerificationError};
use crate::keylog;
use crate::verify::{cert_covers_host, pin_matches, SubjectAltName};

/// Backend context: one `SSL_CTX` configured for QUIC client use.
pub struct OsslContext {
    ctx: SslContext,
}

impl OsslContext {
    /// The underlying OpenSSL context.
    pub fn ssl_context(&self) -> &SslContext {
        &self.ctx
    }
}

enum SessionState {
    /// Session created, no transport attached yet.
    Pending(Ssl),
    /// Handshake driver attached.
    Active(SslStream<Box<dyn Transport>>),
    /// Handshake or attach failed; only cleanup is meaningful now.
    Failed,
}

/// Backend session: one `SSL` handle plus, once the collaborator attaches a
/// transport, the stream the handshake runs over.
pub struct OsslSession {
    state: SessionState,
}

impl OsslSession {
    /// Attach the collaborator's byte transport and run the TLS handshake
    /// over it.
    pub fn connect(&mut self, transport: Box<dyn Transport>) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, SessionState::Failed) {
            SessionState::Pending(ssl) => {
                let mut stream = SslStream::new(ssl, transport)
                    .map_err(|e| Error::Backend(e.to_string()))?;
                stream
                    .connect()
                    .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
                self.state = SessionState::Active(stream);
                Ok(())
            }
            SessionState::Active(_) => panic!("connect called twice on one session"),
            SessionState::Failed => Err(Error::Backend(
                "connect on a failed session".to_string(),
            )),
        }
    }

    /// The negotiated ALPN protocol, once the handshake completed.
    pub fn selected_alpn(&self) -> Option<&[u8]> {
        self.ssl().and_then(|ssl| ssl.selected_alpn_protocol())
    }

    fn ssl(&self) -> Option<&openssl::ssl::SslRef> {
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

impl Read for OsslSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl Write for OsslSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}

/// The OpenSSL-style implementation of the backend capability set.
pub struct OpensslBackend;

impl TlsBackend for OpensslBackend {
    const NAME: &'static str = "OpenSSL";
    const SUPPORTS_KEYLOG: bool = true;
    type Context = OsslContext;
    type ContextBuilder = SslContextBuilder;
    type Session = OsslSession;

    fn build_context(
        config: &ConnectionConfig,
        customize: Option<&ContextCustomizer<Self>>,
    ) -> Result<Self::Context, Error> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())
            .map_err(|e| Error::Backend(e.to_string()))?;
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::Backend(e.to_string()))?;
        // QUIC forbids the TLS 1.3 middlebox compatibility mode.
        builder.clear_options(SslOptions::ENABLE_MIDDLEBOX_COMPAT);

        if let Some(cb) = customize {
            cb(&mut builder)?;
        }

        // Cheap baseline; explicit CA material below takes effect on top.
        if builder.set_default_verify_paths().is_err() {
            warn!("failed to load default verify paths");
        }

        builder
            .set_ciphersuites(config.ciphers())
            .map_err(|e| Error::BadCipherConfig(e.to_string()))?;
        builder
            .set_groups_list(config.groups())
            .map_err(|e| Error::BadGroupConfig(e.to_string()))?;

        if keylog::enabled() {
            builder.set_keylog_callback(|_ssl, line| keylog::write_line(line));
        }

        if config.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
            if config.ca_file.is_some() || config.ca_path.is_some() {
                load_ca_locations(&mut builder, config)?;
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

        Ok(OsslContext {
            ctx: builder.build(),
        })
    }

    fn init_session(
        ctx: &mut Self::Context,
        _config: &ConnectionConfig,
        peer: &PeerDescriptor,
        alpn_wire: Option<&[u8]>,
    ) -> Result<Self::Session, Error> {
        let mut ssl = Ssl::new(&ctx.ctx).map_err(|_| Error::OutOfMemory("session"))?;
        ssl.set_connect_state();
        if let Some(wire) = alpn_wire {
            ssl.set_alpn_protos(wire)
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        if let Some(host) = peer.sni() {
            ssl.set_hostname(host)
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(OsslSession {
            state: SessionState::Pending(ssl),
        })
    }

    fn setup_trust(
        _ctx: &mut Self::Context,
        _session: &mut Self::Session,
        _config: &ConnectionConfig,
    ) -> Result<(), Error> {
        // The store was populated at context build time; nothing is left to
        // finalize for this backend.
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

        if config.verify_peer {
            let result = ssl.verify_result();
            if result != X509VerifyResult::OK {
                return Err(VerificationError::ChainInvalid(
                    result.error_string().to_string(),
                ));
            }
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
            debug!(host, "certificate covers hostname");
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

/// SHA-256 over the DER-encoded SubjectPublicKeyInfo of `cert`.
fn spki_sha256(cert: &X509Ref) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let spki = cert.public_key()?.public_key_to_der()?;
    Ok(openssl::hash::hash(MessageDigest::sha256(), &spki)?.to_vec())
}

/// Common name and subject-alternative names of `cert`.
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

fn load_ca_locations(
    builder: &mut SslContextBuilder,
    config: &ConnectionConfig,
) -> Result<(), Error> {
    let ca_fail = |detail: String| Error::CaLoadFailed {
        ca_file: config.ca_file.clone(),
        ca_path: config.ca_path.clone(),
        detail,
    };

    if let Some(file) = &config.ca_file {
        builder
            .set_ca_file(file)
            .map_err(|e| ca_fail(e.to_string()))?;
        info!(ca_file = %file.display(), "CA file loaded");
    }

    if let Some(dir) = &config.ca_path {
        let mut added = 0usize;
        let entries = std::fs::read_dir(dir).map_err(|e| ca_fail(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| ca_fail(e.to_string()))?.path();
            if !path.is_file() {
                continue;
            }
            let pem = std::fs::read(&path).map_err(|e| ca_fail(e.to_string()))?;
            // Non-PEM files in the directory are skipped, not fatal.
            let Ok(certs) = openssl::x509::X509::stack_from_pem(&pem) else {
                continue;
            };
            for cert in certs {
                builder
                    .cert_store_mut()
                    .add_cert(cert)
                    .map_err(|e| ca_fail(e.to_string()))?;
                added += 1;
            }
        }
        if added == 0 {
            return Err(ca_fail("no CA certificates found in directory".to_string()));
        }
        info!(ca_path = %dir.display(), added, "CA directory loaded");
    }

    Ok(())
}
