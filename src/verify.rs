//! Hostname and pinned-public-key matching shared by the backends.
//!
//! The backends extract certificate names and key material in their own way;
//! the matching rules here are backend-independent.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Pin prefix for a base64-encoded SHA-256 of the DER-encoded SPKI.
const PIN_SHA256_PREFIX: &str = "sha256//";

/// A subject-alternative-name entry extracted from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

/// Match one certificate name pattern against a hostname.
///
/// Comparison is case-insensitive. A wildcard is honored only as the entire
/// leftmost label (`*.example.test`), must be followed by at least two more
/// labels, and never matches across a dot or an IP literal.
pub fn host_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let hostname = hostname.trim_end_matches('.');

    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }

    let Some(tail) = pattern.strip_prefix("*.") else {
        return false;
    };
    // Refuse overly broad patterns like "*.com" and wildcard IP matches.
    if tail.matches('.').count() < 1 || hostname.parse::<IpAddr>().is_ok() {
        return false;
    }
    match hostname.split_once('.') {
        Some((label, host_tail)) => !label.is_empty() && tail.eq_ignore_ascii_case(host_tail),
        None => false,
    }
}

/// Decide whether a certificate covers `hostname`.
///
/// When SAN entries of the relevant type exist they are authoritative and the
/// common name is ignored; the CN is only consulted for certificates carrying
/// no usable SAN.
pub fn cert_covers_host(hostname: &str, common_name: Option<&str>, sans: &[SubjectAltName]) -> bool {
    if let Ok(addr) = hostname.parse::<IpAddr>() {
        return sans
            .iter()
            .any(|san| matches!(san, SubjectAltName::Ip(ip) if *ip == addr));
    }

    let mut saw_dns = false;
    for san in sans {
        if let SubjectAltName::Dns(name) = san {
            saw_dns = true;
            if host_matches(name, hostname) {
                return true;
            }
        }
    }
    if saw_dns {
        return false;
    }
    common_name.is_some_and(|cn| host_matches(cn, hostname))
}

/// Check a `;`-separated pin list against the SHA-256 of the peer's DER SPKI.
///
/// Only `sha256//<base64>` entries are understood; anything else cannot match.
pub fn pin_matches(pin_list: &str, spki_sha256: &[u8]) -> bool {
    pin_list
        .split(';')
        .filter_map(|pin| pin.trim().strip_prefix(PIN_SHA256_PREFIX))
        .filter_map(|b64| BASE64.decode(b64).ok())
        .any(|expected| expected == spki_sha256)
}
