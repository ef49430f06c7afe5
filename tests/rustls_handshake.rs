//! End-to-end handshake tests for the rustls backend.
//!
//! The deferred trust store gives this backend handshake semantics of its
//! own, so these run against a thread-spawned rustls test server:
//! - A handshake driven before trust setup fails closed
//! - Chain-only verification passes a valid chain with the wrong name
//! - Sessions without SNI still verify the chain
//! - Host verification left on still rejects a wrong-name certificate

#![cfg(feature = "rustls-backend")]

use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use rustls::{ServerConfig, ServerConnection};

use qtls::{ConnectionConfig, PeerDescriptor, RustlsBackend, TlsContext};

const CA_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/ca.pem");
const EXAMPLE_BUNDLE: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/example.test.pem");
const OTHER_BUNDLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/other.test.pem");

/// Spawn a one-shot TLS 1.3 rustls server presenting the cert/key bundle at
/// `bundle_path`. The server holds the connection until the client closes it.
fn spawn_rustls_server(bundle_path: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let (mut tcp_stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };

        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(bundle_path).unwrap()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut BufReader::new(
            File::open(bundle_path).unwrap(),
        ))
        .unwrap()
        .unwrap();

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();

        let mut conn = ServerConnection::new(Arc::new(config)).unwrap();
        while conn.is_handshaking() {
            // A client-side verification failure aborts mid-handshake.
            if conn.complete_io(&mut tcp_stream).is_err() {
                return;
            }
        }
        let mut buf = [0u8; 16];
        let _ = tcp_stream.read(&mut buf);
    });

    port
}

/// Drive the client side of the handshake to completion over a fresh TCP
/// connection to `port`.
fn drive_handshake(
    tls: &mut TlsContext<RustlsBackend>,
    port: u16,
) -> std::io::Result<TcpStream> {
    let mut tcp = TcpStream::connect(("127.0.0.1", port))?;
    let conn = tls.session_mut().unwrap().connection_mut();
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    Ok(tcp)
}

#[test]
fn test_handshake_before_trust_setup_fails_closed() {
    let port = spawn_rustls_server(EXAMPLE_BUNDLE);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();

    let mut tls = TlsContext::<RustlsBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(&PeerDescriptor::new("example.test"), None, None)
        .unwrap();

    // Trust setup deliberately skipped: the verifier must reject every
    // certificate rather than accept one against an empty store.
    let err = drive_handshake(&mut tls, port).unwrap_err();
    assert!(
        err.to_string().contains("trust store not initialized"),
        "unexpected handshake error: {err}"
    );
}

#[test]
fn test_trusted_handshake_and_verify_ok() {
    let port = spawn_rustls_server(EXAMPLE_BUNDLE);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();

    let mut tls = TlsContext::<RustlsBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(&PeerDescriptor::new("example.test"), Some(&["h3"]), None)
        .unwrap();
    tls.ensure_trust_ready().unwrap();

    let _tcp = drive_handshake(&mut tls, port).unwrap();
    assert!(tls.verify_peer().is_ok());
}

#[test]
fn test_wrong_name_cert_passes_without_host_verification() {
    // Valid chain, wrong name: with host verification off the handshake and
    // the final verdict must both pass on the chain alone.
    let port = spawn_rustls_server(OTHER_BUNDLE);
    let config = ConnectionConfig::builder()
        .ca_file(CA_FILE)
        .verify_host(false)
        .build();

    let mut tls = TlsContext::<RustlsBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(&PeerDescriptor::new("example.test"), None, None)
        .unwrap();
    tls.ensure_trust_ready().unwrap();

    let _tcp = drive_handshake(&mut tls, port).unwrap();
    assert!(tls.verify_peer().is_ok());
}

#[test]
fn test_no_sni_session_verifies_chain_only() {
    // No SNI means the placeholder server name never matches the
    // certificate; with host verification off that must not fail the
    // handshake.
    let port = spawn_rustls_server(EXAMPLE_BUNDLE);
    let config = ConnectionConfig::builder()
        .ca_file(CA_FILE)
        .verify_host(false)
        .build();

    let mut tls = TlsContext::<RustlsBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(&PeerDescriptor::anonymous(), None, None)
        .unwrap();
    tls.ensure_trust_ready().unwrap();

    let _tcp = drive_handshake(&mut tls, port).unwrap();
    assert!(tls.verify_peer().is_ok());
}

#[test]
fn test_wrong_name_cert_fails_handshake_with_host_verification() {
    let port = spawn_rustls_server(OTHER_BUNDLE);
    let config = ConnectionConfig::builder().ca_file(CA_FILE).build();

    let mut tls = TlsContext::<RustlsBackend>::new();
    tls.build(Arc::new(config), None).unwrap();
    tls.init_session(&PeerDescriptor::new("example.test"), None, None)
        .unwrap();
    tls.ensure_trust_ready().unwrap();

    assert!(drive_handshake(&mut tls, port).is_err());
}
