//! Error types for TLS context setup and peer verification.
//!
//! Setup failures ([`Error`]) abort the connection attempt and carry the
//! backend's native error text so callers have something useful to log.
//! Verification failures ([`VerificationError`]) are a separate, closed set:
//! a connection either verifies or it does not, there is no partial verdict.

use std::path::PathBuf;

/// Errors raised while building a TLS context or initializing a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured TLS 1.3 cipher-suite list was rejected by the backend.
    #[error("failed to set ciphers: {0}")]
    BadCipherConfig(String),

    /// The configured key-exchange group list was rejected by the backend.
    #[error("failed to set curves: {0}")]
    BadGroupConfig(String),

    /// CA material was configured but could not be loaded.
    #[error("error setting certificate verify locations: CAfile: {} CApath: {}: {detail}",
            display_or_none(ca_file), display_or_none(ca_path))]
    CaLoadFailed {
        ca_file: Option<PathBuf>,
        ca_path: Option<PathBuf>,
        detail: String,
    },

    /// Keylog export is enabled process-wide but the backend has no secret
    /// export callback. Refusing the connection beats silently not logging.
    #[error("{0} was built without keylog callback support")]
    KeylogUnsupported(&'static str),

    /// The backend could not allocate a context or session.
    #[error("out of memory allocating TLS {0}")]
    OutOfMemory(&'static str),

    /// The application's context-customization callback rejected the setup.
    #[error("error signaled by TLS context callback: {0}")]
    CallbackRejected(String),

    /// The TLS handshake itself failed while a transport was being driven.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Any other backend-native failure.
    #[error("TLS backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer verification verdicts other than success.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    /// The certificate does not cover the hostname the session was opened for.
    #[error("certificate subject does not match hostname {0:?}")]
    HostMismatch(String),

    /// The peer's public key does not match the configured pin.
    #[error("public key does not match pinned public key")]
    PinMismatch,

    /// The certificate chain did not validate against the trust store.
    #[error("certificate chain verification failed: {0}")]
    ChainInvalid(String),

    /// Host verification is on but no SNI hostname was set at session init.
    /// Failing deterministically here beats silently passing.
    #[error("host verification requested but no SNI hostname was set")]
    NoSniForVerification,
}

fn display_or_none(p: &Option<PathBuf>) -> String {
    p.as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Result alias for setup operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_load_failed_names_paths() {
        let err = Error::CaLoadFailed {
            ca_file: Some(PathBuf::from("/etc/ssl/ca.pem")),
            ca_path: None,
            detail: "no such file".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/ssl/ca.pem"));
        assert!(msg.contains("CApath: none"));
    }

    #[test]
    fn test_verification_errors_are_comparable() {
        assert_eq!(
            VerificationError::NoSniForVerification,
            VerificationError::NoSniForVerification
        );
        assert_ne!(
            VerificationError::PinMismatch,
            VerificationError::ChainInvalid("x".into())
        );
    }
}
