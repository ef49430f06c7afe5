//! End-to-end handshake and peer verification tests
//!
//! These tests run a real TLS 1.3 handshake against a thread-spawned test
//! server and check:
//! - Successful verification against the test CA
//! - HostMismatch when the server presents a certificate for another name
//! - NoSniForVerification when host verification is on without a hostname
//! - Handshake failure when the server's CA is not trusted
//! - ALPN negotiation
//! - Public key pinning (match and mismatch)

#![cfg(feature = "openssl-backend")]

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslContextBuilder, SslMethod, SslStream, SslVersion,
};
use openssl::x509::X509;

use qtls::{
    ConnectionConfig, Error, OpensslBackend, PeerDescriptor, TlsContext, VerificationError,
};

const CA_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/ca.pem");
const EXAMPLE_BUNDLE: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/example.test.pem");
const OTHER_BUNDLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/other.test.pem");

/// Spawn a one-shot TLS 1.3 server presenting the cert/key bundle at
/// `bundle_path`, optionally offering `alpn` in the ALPN select callback.
/// The server holds the connection until the client closes it.
fn spawn_tls_server(bundle_path: &str, alpn: Option<&'static [u8]>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let pem = std::fs::read(bundle_path).unwrap();

    thread::spawn(move || {
        let (tcp_stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };

        let cert = X509::from_pem(&pem).unwrap();
        let key = PKey::private_key_from_pem(&pem).unwrap();

        let mut builder = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_3))
            .unwrap();
        builder.set_certificate(&cert).unwrap();
        builder.set_private_key(&key).unwrap();
        if let Some(proto) = alpn {
            let mut server_wire = vec![proto.len() as u8];
            server_wire.extend_from_slice(proto);
            // select_next_proto's return borrows from its arguments, so the
            // server's wire-format list must outlive every callback invocation.
            let server_wire: &'static [u8] = server_wire.leak();
            builder.set_alpn_select_callback(move |_ssl, client| {
                select_next_proto(server_wire, client).ok_or(AlpnError::NOACK)
            });
        }
        let ctx = builder.build();

        let ssl = Ssl::new(&ctx).unwrap();
        let mut stream = SslStream::new(ssl, tcp_stream).unwrap();
        if stream.accept().is_ok() {
            // Hold the connection open until the client is done.
            let mut buf = [0u8; 16];
            let _ = stream.ssl_read(&mut buf);
        }
    });

    port
}

/// Build a context, initialize a session for `peer` and run the handshake
/// against the server on `port`.
fn handshake(
    config: ConnectionConfig,
    peer: &PeerDescriptor,
    alpn: Option<&[&str]>,
    port: u16,
) -> (TlsContext<OpensslBackend>, Result<(), Error>) {
    let mut tls = TlsContext::<OpensslBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(peer, alpn, None).unwrap();
    tls.ensure_trust_ready().unwrap();

    let transport = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let result = tls.session_mut().unwrap().connect(Box::new(transport));
    (tls, result)
}

/// `sha256//<base64>` pin for the public key in the bundle at `bundle_path`.
fn pin_for(bundle_path: &str) -> String {
    let pem = std::fs::read(bundle_path).unwrap();
    let cert = X509::from_pem(&pem).unwrap();
    let spki = cert.public_key().unwrap().public_key_to_der().unwrap();
    let digest = openssl::hash::hash(MessageDigest::sha256(), &spki).unwrap();
    format!("sha256//{}", BASE64.encode(&digest))
}

#[test]
fn test_handshake_and_verify_ok() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();
    let (tls, result) = handshake(config, &PeerDescriptor::new("example.test"), None, port);

    result.unwrap();
    assert!(tls.verify_peer().is_ok());
}

#[test]
fn test_wrong_hostname_is_host_mismatch() {
    // Same CA, so the chain verifies; only the name is wrong.
    let port = spawn_tls_server(OTHER_BUNDLE, None);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();
    let (tls, result) = handshake(config, &PeerDescriptor::new("example.test"), None, port);

    result.unwrap();
    assert_eq!(
        tls.verify_peer().unwrap_err(),
        VerificationError::HostMismatch("example.test".to_string())
    );
}

#[test]
fn test_no_sni_with_host_verification_fails() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();
    let (tls, result) = handshake(config, &PeerDescriptor::anonymous(), None, port);

    result.unwrap();
    assert_eq!(
        tls.verify_peer().unwrap_err(),
        VerificationError::NoSniForVerification
    );
}

#[test]
fn test_insecure_accepts_any_certificate() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let (mut tls, result) = handshake(
        ConnectionConfig::insecure(),
        &PeerDescriptor::new("example.test"),
        None,
        port,
    );

    result.unwrap();
    assert!(tls.verify_peer().is_ok());
    tls.cleanup();
    assert!(tls.is_empty());
}

#[test]
fn test_untrusted_ca_fails_handshake() {
    // No CA material for the test CA, so chain verification fails during
    // the handshake itself.
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let (mut tls, result) = handshake(
        ConnectionConfig::default(),
        &PeerDescriptor::new("example.test"),
        None,
        port,
    );

    assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    // Cleanup must work on the failed session.
    tls.cleanup();
    assert!(tls.is_empty());
}

#[test]
fn test_alpn_negotiation() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, Some(b"h3"));
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();
    let (tls, result) = handshake(
        config,
        &PeerDescriptor::new("example.test"),
        Some(&["h3", "hq-interop"]),
        port,
    );

    result.unwrap();
    assert_eq!(tls.session().unwrap().selected_alpn(), Some(&b"h3"[..]));
}

#[test]
fn test_pinned_pubkey_match() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let config = ConnectionConfig::builder()
        .ca_file(CA_FILE)
        .pinned_pubkey(pin_for(EXAMPLE_BUNDLE))
        .build();
    let (tls, result) = handshake(config, &PeerDescriptor::new("example.test"), None, port);

    result.unwrap();
    assert!(tls.verify_peer().is_ok());
}

#[test]
fn test_pinned_pubkey_mismatch() {
    let port = spawn_tls_server(EXAMPLE_BUNDLE, None);
    let wrong_pin = format!("sha256//{}", BASE64.encode([0u8; 32]));
    let config = ConnectionConfig::builder()
        .ca_file(CA_FILE)
        .pinned_pubkey(wrong_pin)
        .build();
    let (tls, result) = handshake(config, &PeerDescriptor::new("example.test"), None, port);

    result.unwrap();
    assert_eq!(
        tls.verify_peer().unwrap_err(),
        VerificationError::PinMismatch
    );
}
