//! mTLS termination success and CRL-based revocation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use l4_mtls_proxy::config::{HostConfig, ServerConfig, TlsConfig, TlsMode};
use l4_mtls_proxy::metrics::NullSink;
use l4_mtls_proxy::proxy::Proxy;
use std::sync::atomic::Ordering;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

fn plain_host(port: u16) -> HostConfig {
    HostConfig {
        host: "127.0.0.1".to_owned(),
        port,
        timeout_duration: Duration::ZERO,
        tls: None,
    }
}

fn load_certs(path: &std::path::Path) -> Vec<CertificateDer<'static>> {
    let file = std::fs::File::open(path).unwrap();
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn load_key(path: &std::path::Path) -> PrivateKeyDer<'static> {
    let file = std::fs::File::open(path).unwrap();
    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .unwrap()
        .unwrap()
}

/// A root store trusting only the given CA, for the test TLS client.
fn root_store(ca_path: &std::path::Path) -> Arc<RootCertStore> {
    let mut store = RootCertStore::empty();
    let (added, _) = store.add_parsable_certificates(load_certs(ca_path));
    assert_eq!(added, 1);
    Arc::new(store)
}

#[tokio::test]
async fn mutual_tls_handshake_succeeds_and_forwards() {
    let server_cert = common::make_leaf_cert("127.0.0.1".parse().unwrap());
    let client_cert = common::make_leaf_cert("127.0.0.1".parse().unwrap());

    let listener_port = common::free_port().await;
    let target_port = common::free_port().await;
    common::spawn_echo_server(target_port).await;

    let tls = TlsConfig {
        ca_cert_path: Some(client_cert.ca_path.display().to_string()),
        cert_path: Some(server_cert.cert_path.display().to_string()),
        key_path: Some(server_cert.key_path.display().to_string()),
        crl_path: None,
        mode: Some(TlsMode::Mutual),
        sni: None,
        subject_alt_names: vec![],
        role_is_server: true,
    };
    let cfg = ServerConfig {
        name: "s1".to_owned(),
        listener: HostConfig {
            host: "127.0.0.1".to_owned(),
            port: listener_port,
            timeout_duration: Duration::ZERO,
            tls: Some(tls),
        },
        targets: vec![plain_host(target_port)],
        mirror: None,
    };
    let proxy = Arc::new(Proxy::new(cfg, NullSink::sink()).unwrap());
    let handle = Arc::clone(&proxy);
    tokio::spawn(async move { handle.run().await });

    common::wait_for_port(listener_port, Duration::from_secs(2)).await;

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store(&server_cert.ca_path))
        .with_client_auth_cert(load_certs(&client_cert.cert_path), load_key(&client_cert.key_path))
        .unwrap();
    let connector = TlsConnector::from(Arc::new(client_config));
    let tcp = TcpStream::connect(("127.0.0.1", listener_port)).await.unwrap();
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls_sock = connector.connect(server_name, tcp).await.unwrap();

    tls_sock.write_all(b"secure").await.unwrap();
    let mut buf = [0u8; 6];
    tls_sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"secure");

    proxy.shutdown().await;
}

#[tokio::test]
async fn revoked_client_certificate_is_rejected() {
    let server_cert = common::make_leaf_cert("127.0.0.1".parse().unwrap());
    let client_cert = common::make_leaf_cert("127.0.0.1".parse().unwrap());
    let crl_path = common::write_crl(&client_cert, &[client_cert.serial]);

    let listener_port = common::free_port().await;
    let target_port = common::free_port().await;
    common::spawn_echo_server(target_port).await;

    let tls = TlsConfig {
        ca_cert_path: Some(client_cert.ca_path.display().to_string()),
        cert_path: Some(server_cert.cert_path.display().to_string()),
        key_path: Some(server_cert.key_path.display().to_string()),
        crl_path: Some(crl_path.display().to_string()),
        mode: Some(TlsMode::Mutual),
        sni: None,
        subject_alt_names: vec![],
        role_is_server: true,
    };
    let cfg = ServerConfig {
        name: "s1".to_owned(),
        listener: HostConfig {
            host: "127.0.0.1".to_owned(),
            port: listener_port,
            timeout_duration: Duration::ZERO,
            tls: Some(tls),
        },
        targets: vec![plain_host(target_port)],
        mirror: None,
    };
    let proxy = Arc::new(Proxy::new(cfg, NullSink::sink()).unwrap());
    let handle = Arc::clone(&proxy);
    tokio::spawn(async move { handle.run().await });

    common::wait_for_port(listener_port, Duration::from_secs(2)).await;

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store(&server_cert.ca_path))
        .with_client_auth_cert(load_certs(&client_cert.cert_path), load_key(&client_cert.key_path))
        .unwrap();
    let connector = TlsConnector::from(Arc::new(client_config));
    let tcp = TcpStream::connect(("127.0.0.1", listener_port)).await.unwrap();
    let server_name = ServerName::try_from("127.0.0.1").unwrap();

    // TLS 1.3 clients can consider the handshake done as soon as they've
    // sent their own Finished, before the server has verified (and
    // rejected) the client certificate — so the rejection only surfaces on
    // the first post-handshake read or write, not necessarily on connect().
    let rejected = match connector.connect(server_name, tcp).await {
        Err(_) => true,
        Ok(mut tls_sock) => {
            let write_failed = tls_sock.write_all(b"ping").await.is_err();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_secs(2), tls_sock.read(&mut buf)).await;
            write_failed || matches!(read, Ok(Err(_)) | Ok(Ok(0)))
        }
    };
    assert!(rejected, "handshake with a revoked client cert must fail");

    proxy.shutdown().await;
}

#[tokio::test]
async fn failed_handshake_increments_downstream_conn_error() {
    let server_cert = common::make_leaf_cert("127.0.0.1".parse().unwrap());

    let listener_port = common::free_port().await;
    let target_port = common::free_port().await;
    common::spawn_echo_server(target_port).await;

    let tls = TlsConfig {
        ca_cert_path: None,
        cert_path: Some(server_cert.cert_path.display().to_string()),
        key_path: Some(server_cert.key_path.display().to_string()),
        crl_path: None,
        mode: Some(TlsMode::Simple),
        sni: None,
        subject_alt_names: vec![],
        role_is_server: true,
    };
    let cfg = ServerConfig {
        name: "s1".to_owned(),
        listener: HostConfig {
            host: "127.0.0.1".to_owned(),
            port: listener_port,
            timeout_duration: Duration::ZERO,
            tls: Some(tls),
        },
        targets: vec![plain_host(target_port)],
        mirror: None,
    };
    let sink = common::CountingSink::default();
    let downstream_conn_error = Arc::clone(&sink.downstream_conn_error);
    let proxy = Arc::new(Proxy::new(cfg, Arc::new(sink)).unwrap());
    let handle = Arc::clone(&proxy);
    tokio::spawn(async move { handle.run().await });

    // `common::wait_for_port` would itself connect-then-drop, which a TLS
    // listener sees as its own failed handshake; give the listener a moment
    // to bind instead so only our one garbage connection is counted below.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A plain TCP client speaking no TLS at all fails the handshake.
    let mut tcp = TcpStream::connect(("127.0.0.1", listener_port)).await.unwrap();
    let _ = tcp.write_all(b"not a tls client hello").await;
    let mut buf = [0u8; 16];
    let _ = tcp.read(&mut buf).await;
    drop(tcp);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(downstream_conn_error.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
}
