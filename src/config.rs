//! Connection configuration and peer description.
//!
//! A [`ConnectionConfig`] is shared read-only across many connection attempts;
//! a [`PeerDescriptor`] belongs to exactly one attempt. Absent fields fall
//! back to backend defaults.

use std::path::PathBuf;

/// Default TLS 1.3 cipher suites for QUIC.
pub const QUIC_CIPHERS: &str = "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:\
TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_CCM_SHA256";

/// Default key-exchange groups for QUIC.
pub const QUIC_GROUPS: &str = "P-256:P-384:P-521";

/// TLS settings for a pool of QUIC connection attempts.
///
/// Build one with [`ConnectionConfig::builder`] and share it (`Arc`) across
/// attempts. Both verification flags default to on; disabling them is a
/// deliberate opt-out, never a default.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TLS 1.3 cipher-suite list, colon-separated. `None` uses [`QUIC_CIPHERS`].
    pub cipher_list13: Option<String>,
    /// Key-exchange group list, colon-separated. `None` uses [`QUIC_GROUPS`].
    pub curves: Option<String>,
    /// CA bundle file for chain verification.
    pub ca_file: Option<PathBuf>,
    /// Directory of CA certificates for chain verification.
    pub ca_path: Option<PathBuf>,
    /// Verify the peer's certificate chain.
    pub verify_peer: bool,
    /// Verify that the certificate covers the SNI hostname.
    pub verify_host: bool,
    /// Pinned public key(s): `sha256//<base64>`, `;`-separated alternatives.
    pub pinned_pubkey: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            cipher_list13: None,
            curves: None,
            ca_file: None,
            ca_path: None,
            verify_peer: true,
            verify_host: true,
            pinned_pubkey: None,
        }
    }
}

impl ConnectionConfig {
    /// Start building a configuration with verification enabled.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: ConnectionConfig::default(),
        }
    }

    /// A configuration that accepts any certificate and any hostname.
    pub fn insecure() -> Self {
        ConnectionConfig {
            verify_peer: false,
            verify_host: false,
            ..ConnectionConfig::default()
        }
    }

    /// Effective cipher-suite list.
    pub fn ciphers(&self) -> &str {
        self.cipher_list13.as_deref().unwrap_or(QUIC_CIPHERS)
    }

    /// Effective key-exchange group list.
    pub fn groups(&self) -> &str {
        self.curves.as_deref().unwrap_or(QUIC_GROUPS)
    }
}

/// Builder for [`ConnectionConfig`].
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the TLS 1.3 cipher-suite list.
    pub fn cipher_list13(mut self, ciphers: impl Into<String>) -> Self {
        self.config.cipher_list13 = Some(ciphers.into());
        self
    }

    /// Set the key-exchange group list.
    pub fn curves(mut self, curves: impl Into<String>) -> Self {
        self.config.curves = Some(curves.into());
        self
    }

    /// Set the CA bundle file.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    /// Set the CA certificate directory.
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_path = Some(path.into());
        self
    }

    /// Enable/disable certificate chain verification.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    /// Enable/disable hostname verification.
    pub fn verify_host(mut self, verify: bool) -> Self {
        self.config.verify_host = verify;
        self
    }

    /// Pin the peer's public key: `sha256//<base64>`, `;`-separated.
    pub fn pinned_pubkey(mut self, pin: impl Into<String>) -> Self {
        self.config.pinned_pubkey = Some(pin.into());
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// The peer one connection attempt is directed at.
#[derive(Debug, Clone, Default)]
pub struct PeerDescriptor {
    sni: Option<String>,
}

impl PeerDescriptor {
    /// A peer addressed by hostname; the name is sent as SNI and used for
    /// host verification.
    pub fn new(sni: impl Into<String>) -> Self {
        PeerDescriptor {
            sni: Some(sni.into()),
        }
    }

    /// A peer with no hostname: no SNI is sent and host verification cannot
    /// succeed while enabled.
    pub fn anonymous() -> Self {
        PeerDescriptor { sni: None }
    }

    /// The SNI hostname, if any.
    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }
}

/// Encode an ALPN protocol list into the length-prefixed wire format.
/// Protocol names are limited to 255 bytes by the wire format itself.
pub(crate) fn encode_alpn(protocols: &[&str]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        assert!(
            proto.len() <= u8::MAX as usize,
            "ALPN protocol name too long: {} bytes",
            proto.len()
        );
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}
