//! rustls backend.
//!
//! rustls freezes its `ClientConfig` before a connection exists, which is at
//! odds with trust setup that may only happen once the session does. The
//! context therefore installs a [`DeferredVerifier`] shell at build time and
//! fills in the real webpki verifier during trust setup; a handshake driven
//! before that point fails closed.
//!
//! Chain and hostname verification both happen inside the rustls handshake;
//! with host verification off the verifier excuses name mismatches so the
//! chain verdict alone decides. [`TlsBackend::verify_peer`] re-checks the
//! hostname from the certificate it captured and folds in the pinned-key
//! comparison so callers get the same single verdict as with the other
//! backends.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::{ContextCustomizer, TlsBackend};
use crate::config::{ConnectionConfig, PeerDescriptor};
use crate::error::{Error, VerificationError};
use crate::keylog;
use crate::verify::{cert_covers_host, pin_matches, SubjectAltName};

/// Placeholder name for sessions opened without SNI; never sent on the wire
/// because `enable_sni` is turned off for those sessions.
const NO_SNI_PLACEHOLDER: &str = "no.sni.invalid";

/// Verifier shell whose real webpki verifier arrives at trust-setup time.
#[derive(Debug)]
struct DeferredVerifier {
    inner: OnceLock<Arc<WebPkiServerVerifier>>,
    verify_host: bool,
}

impl DeferredVerifier {
    fn new(verify_host: bool) -> Self {
        DeferredVerifier {
            inner: OnceLock::new(),
            verify_host,
        }
    }

    fn install(&self, verifier: Arc<WebPkiServerVerifier>) {
        let _ = self.inner.set(verifier);
    }

    fn ready(&self) -> bool {
        self.inner.get().is_some()
    }
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.get() {
            // webpki couples the hostname check to chain verification. With
            // host verification off, or for sessions opened without SNI
            // (where `server_name` is the placeholder), a name mismatch
            // alone must not fail the handshake; the chain verdict stands.
            Some(v) => match v.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) if !self.verify_host => Ok(ServerCertVerified::assertion()),
                other => other,
            },
            None => Err(rustls::Error::General(
                "trust store not initialized".to_string(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match self.inner.get() {
            Some(v) => v.verify_tls12_signature(message, cert, dss),
            None => Err(rustls::Error::General(
                "trust store not initialized".to_string(),
            )),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match self.inner.get() {
            Some(v) => v.verify_tls13_signature(message, cert, dss),
            None => Err(rustls::Error::General(
                "trust store not initialized".to_string(),
            )),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match self.inner.get() {
            Some(v) => v.supported_verify_schemes(),
            None => default_verify_schemes(),
        }
    }
}

fn default_verify_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ED25519,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
    ]
}

/// The deliberate opt-out verifier for `verify_peer == false`.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        warn!("peer verification disabled: accepting any server certificate");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_verify_schemes()
    }
}

/// Keylog adapter writing NSS-format lines into the shared keylog file.
#[derive(Debug)]
struct SharedKeyLog;

impl rustls::KeyLog for SharedKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        keylog::write_line(&format!(
            "{} {} {}",
            label,
            hex(client_random),
            hex(secret)
        ));
    }

    fn will_log(&self, _label: &str) -> bool {
        keylog::enabled()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Backend context: the frozen client config plus the deferred verifier slot.
pub struct RustlsContext {
    config: Arc<ClientConfig>,
    provider: Arc<CryptoProvider>,
    verifier: Option<Arc<DeferredVerifier>>,
}

/// Backend session wrapping the rustls connection. The QUIC collaborator
/// drives the handshake through [`RustlsSession::connection_mut`] with
/// `read_tls`/`write_tls`.
pub struct RustlsSession {
    conn: ClientConnection,
}

impl RustlsSession {
    pub fn connection(&self) -> &ClientConnection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ClientConnection {
        &mut self.conn
    }
}

/// The rustls implementation of the backend capability set.
pub struct RustlsBackend;

impl TlsBackend for RustlsBackend {
    const NAME: &'static str = "rustls";
    const SUPPORTS_KEYLOG: bool = true;
    type Context = RustlsContext;
    type ContextBuilder = ClientConfig;
    type Session = RustlsSession;

    fn build_context(
        config: &ConnectionConfig,
        customize: Option<&ContextCustomizer<Self>>,
    ) -> Result<Self::Context, Error> {
        let provider = Arc::new(provider_for(config)?);
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Backend(e.to_string()))?;

        let verifier = if config.verify_peer {
            Some(Arc::new(DeferredVerifier::new(config.verify_host)))
        } else {
            None
        };
        let mut client_config = match &verifier {
            Some(v) => builder
                .dangerous()
                .with_custom_certificate_verifier(v.clone()),
            // Deliberate opt-out: any certificate is accepted.
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert)),
        }
        .with_no_client_auth();

        if keylog::enabled() {
            client_config.key_log = Arc::new(SharedKeyLog);
        }

        if let Some(cb) = customize {
            cb(&mut client_config)?;
        }

        Ok(RustlsContext {
            config: Arc::new(client_config),
            provider,
            verifier,
        })
    }

    fn init_session(
        ctx: &mut Self::Context,
        _config: &ConnectionConfig,
        peer: &PeerDescriptor,
        alpn_wire: Option<&[u8]>,
    ) -> Result<Self::Session, Error> {
        // ALPN and SNI suppression are per-connection here, but rustls wants
        // them on the (shared) config, so adjust a copy when needed.
        let alpn = alpn_wire.map(decode_alpn_wire);
        let effective = if alpn.is_some() || peer.sni().is_none() {
            let mut copy = (*ctx.config).clone();
            if let Some(protocols) = alpn {
                copy.alpn_protocols = protocols;
            }
            if peer.sni().is_none() {
                copy.enable_sni = false;
            }
            Arc::new(copy)
        } else {
            ctx.config.clone()
        };

        let server_name = match peer.sni() {
            Some(host) => ServerName::try_from(host.to_string())
                .map_err(|e| Error::Backend(format!("invalid SNI hostname: {e}")))?,
            None => ServerName::try_from(NO_SNI_PLACEHOLDER.to_string())
                .expect("placeholder name is valid"),
        };

        let conn = ClientConnection::new(effective, server_name)
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(RustlsSession { conn })
    }

    fn setup_trust(
        ctx: &mut Self::Context,
        _session: &mut Self::Session,
        config: &ConnectionConfig,
    ) -> Result<(), Error> {
        let Some(slot) = &ctx.verifier else {
            // Verification disabled; there is no trust store to finalize.
            return Ok(());
        };
        if slot.ready() {
            return Ok(());
        }

        let roots = load_root_store(config)?;
        if roots.is_empty() {
            // Zero anchors configured and no fallback: proceeding is allowed,
            // but every handshake will fail closed at the verifier.
            warn!("peer verification enabled with no trust anchors loaded");
            return Ok(());
        }
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), ctx.provider.clone())
                .build()
                .map_err(|e| Error::CaLoadFailed {
                    ca_file: config.ca_file.clone(),
                    ca_path: config.ca_path.clone(),
                    detail: e.to_string(),
                })?;
        slot.install(verifier);
        debug!("trust store finalized");
        Ok(())
    }

    fn verify_peer(
        _ctx: &Self::Context,
        session: &Self::Session,
        config: &ConnectionConfig,
        sni: Option<&str>,
    ) -> Result<(), VerificationError> {
        let certs = session.conn.peer_certificates();
        let needs_cert =
            config.verify_peer || config.verify_host || config.pinned_pubkey.is_some();
        let end_entity = match certs.and_then(|c| c.first()) {
            Some(cert) => cert,
            None if needs_cert => {
                return Err(VerificationError::ChainInvalid(
                    "no peer certificate".to_string(),
                ))
            }
            None => return Ok(()),
        };
        let (_, parsed) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|e| VerificationError::ChainInvalid(e.to_string()))?;

        if config.verify_host {
            let host = sni.ok_or(VerificationError::NoSniForVerification)?;
            let (cn, sans) = subject_names(&parsed);
            if !cert_covers_host(host, cn.as_deref(), &sans) {
                return Err(VerificationError::HostMismatch(host.to_string()));
            }
            debug!(host, "certificate covers hostname");
        }

        if let Some(pins) = &config.pinned_pubkey {
            let digest = Sha256::digest(parsed.tbs_certificate.subject_pki.raw);
            if !pin_matches(pins, digest.as_slice()) {
                return Err(VerificationError::PinMismatch);
            }
        }

        info!("peer verified");
        Ok(())
    }
}

fn decode_alpn_wire(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut protocols = Vec::new();
    let mut pos = 0;
    while pos < wire.len() {
        let len = wire[pos] as usize;
        pos += 1;
        if pos + len > wire.len() {
            break;
        }
        protocols.push(wire[pos..pos + len].to_vec());
        pos += len;
    }
    protocols
}

/// Translate the colon-separated suite and group lists into a ring provider.
/// Entries ring cannot offer (CCM, P-521) are skipped; a list yielding
/// nothing usable is a configuration error.
fn provider_for(config: &ConnectionConfig) -> Result<CryptoProvider, Error> {
    use rustls::crypto::ring;

    let mut cipher_suites = Vec::new();
    for name in config.ciphers().split(':').filter(|s| !s.is_empty()) {
        match name {
            "TLS_AES_128_GCM_SHA256" => {
                cipher_suites.push(ring::cipher_suite::TLS13_AES_128_GCM_SHA256)
            }
            "TLS_AES_256_GCM_SHA384" => {
                cipher_suites.push(ring::cipher_suite::TLS13_AES_256_GCM_SHA384)
            }
            "TLS_CHACHA20_POLY1305_SHA256" => {
                cipher_suites.push(ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256)
            }
            other => debug!(suite = other, "cipher suite not offered by provider, skipped"),
        }
    }
    if cipher_suites.is_empty() {
        return Err(Error::BadCipherConfig(format!(
            "no usable TLS 1.3 cipher suite in {:?}",
            config.ciphers()
        )));
    }

    let mut kx_groups = Vec::new();
    for name in config.groups().split(':').filter(|s| !s.is_empty()) {
        match name {
            "X25519" | "x25519" => kx_groups.push(ring::kx_group::X25519),
            "P-256" | "secp256r1" => kx_groups.push(ring::kx_group::SECP256R1),
            "P-384" | "secp384r1" => kx_groups.push(ring::kx_group::SECP384R1),
            other => debug!(group = other, "key-exchange group not offered by provider, skipped"),
        }
    }
    if kx_groups.is_empty() {
        return Err(Error::BadGroupConfig(format!(
            "no usable key-exchange group in {:?}",
            config.groups()
        )));
    }

    Ok(CryptoProvider {
        cipher_suites,
        kx_groups,
        ..ring::default_provider()
    })
}

fn load_root_store(config: &ConnectionConfig) -> Result<RootCertStore, Error> {
    let ca_fail = |detail: String| Error::CaLoadFailed {
        ca_file: config.ca_file.clone(),
        ca_path: config.ca_path.clone(),
        detail,
    };

    let mut roots = RootCertStore::empty();
    if let Some(file) = &config.ca_file {
        add_pem_file(&mut roots, file).map_err(&ca_fail)?;
        info!(ca_file = %file.display(), "CA file loaded");
    }
    if let Some(dir) = &config.ca_path {
        let entries = std::fs::read_dir(dir).map_err(|e| ca_fail(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| ca_fail(e.to_string()))?.path();
            if path.is_file() {
                // Unparseable files in the directory are skipped, not fatal.
                let _ = add_pem_file(&mut roots, &path);
            }
        }
        info!(ca_path = %dir.display(), "CA directory loaded");
    }

    #[cfg(feature = "ca-fallback")]
    if config.ca_file.is_none() && config.ca_path.is_none() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(roots)
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut reader = BufReader::new(file);
    let mut added = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| e.to_string())?;
        roots.add(cert).map_err(|e| e.to_string())?;
        added += 1;
    }
    if added == 0 {
        return Err("no CA certificates found".to_string());
    }
    Ok(())
}

fn subject_names(cert: &X509Certificate<'_>) -> (Option<String>, Vec<SubjectAltName>) {
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned);

    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(SubjectAltName::Dns((*dns).to_string())),
                GeneralName::IPAddress(bytes) => {
                    if let Some(addr) = ip_from_der(bytes) {
                        sans.push(SubjectAltName::Ip(addr));
                    }
                }
                _ => {}
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
