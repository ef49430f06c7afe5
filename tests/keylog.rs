//! Keylog export over a real handshake.
//!
//! Kept in its own test binary: the keylog file is process-global and the
//! first open wins, so this must not share a process with tests that leave
//! keylog export disabled.

#![cfg(feature = "openssl-backend")]

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslStream, SslVersion};
use openssl::x509::X509;

use qtls::{keylog, ConnectionConfig, OpensslBackend, PeerDescriptor, TlsContext};

const EXAMPLE_BUNDLE: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/example.test.pem");

fn spawn_tls_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let pem = std::fs::read(EXAMPLE_BUNDLE).unwrap();

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
        let ctx = builder.build();

        let ssl = Ssl::new(&ctx).unwrap();
        let mut stream = SslStream::new(ssl, tcp_stream).unwrap();
        if stream.accept().is_ok() {
            let mut buf = [0u8; 16];
            let _ = stream.ssl_read(&mut buf);
        }
    });

    port
}

#[test]
fn test_handshake_secrets_reach_keylog_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keylog.txt");
    keylog::open_at(&path).unwrap();
    assert!(keylog::enabled());

    let port = spawn_tls_server();
    let mut tls = TlsContext::<OpensslBackend>::new();
    tls.build(Arc::new(ConnectionConfig::insecure()), None).unwrap();
    tls.init_session(&PeerDescriptor::new("example.test"), None, None)
        .unwrap();
    tls.ensure_trust_ready().unwrap();

    let transport = TcpStream::connect(("127.0.0.1", port)).unwrap();
    tls.session_mut()
        .unwrap()
        .connect(Box::new(transport))
        .unwrap();

    // Another open while export is running keeps the first handle; the path
    // may differ from ours if the environment had already opened one.
    let active = keylog::current_path().unwrap();
    keylog::open_at(&dir.path().join("second.txt")).unwrap();
    assert_eq!(keylog::current_path().unwrap(), active);

    let mut contents = String::new();
    std::fs::File::open(&active)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert!(
        contents.contains("CLIENT_HANDSHAKE_TRAFFIC_SECRET"),
        "keylog file missing handshake secrets: {contents:?}"
    );
    assert!(contents.contains("CLIENT_TRAFFIC_SECRET_0"));
}
