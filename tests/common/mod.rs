//! Shared fixtures for the scenario tests: free ports, a plain echo
//! target, and throw-away mTLS certificates via `rcgen`.
#![allow(dead_code)]

use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyUsagePurpose, SanType};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use l4_mtls_proxy::metrics::MetricsSink;

/// A [`MetricsSink`] that only records `downstream_conn_error` calls, for
/// asserting on the handshake-failure accounting path.
#[derive(Clone, Default)]
pub struct CountingSink {
    pub downstream_conn_error: Arc<std::sync::atomic::AtomicU64>,
}

impl MetricsSink for CountingSink {
    fn downstream_conn_total(&self, _server: &str) {}
    fn downstream_conn_error(&self, _server: &str) {
        self.downstream_conn_error.fetch_add(1, Ordering::SeqCst);
    }
    fn downstream_conn_active_inc(&self, _server: &str) {}
    fn downstream_conn_active_dec(&self, _server: &str) {}
    fn upstream_conn_total(&self, _host: &str, _port: u16) {}
    fn upstream_conn_error(&self, _host: &str, _port: u16) {}
    fn upstream_conn_active_inc(&self, _host: &str, _port: u16) {}
    fn upstream_conn_active_dec(&self, _host: &str, _port: u16) {}
    fn upstream_dial_error(&self, _host: &str, _port: u16) {}
    fn mirror_dial_error(&self, _host: &str, _port: u16) {}
}

/// Grab a free localhost port by binding to port 0 and dropping the socket.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Spawn a plain TCP echo server, accepting connections until the task is
/// dropped.
pub async fn spawn_echo_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
}

/// Spawn a TCP server on `port` that never writes back, used to exercise
/// the upstream read deadline.
pub async fn spawn_silent_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            // Hold the connection open without ever writing anything.
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let mut sock = sock;
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
}

/// A TCP server that records every byte sequence it receives into a shared
/// buffer, used as the mirror target in fan-out tests.
#[derive(Clone, Default)]
pub struct RecordingServer {
    pub received: Arc<Mutex<Vec<u8>>>,
}

impl RecordingServer {
    pub async fn spawn(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let this = RecordingServer::default();
        let received = Arc::clone(&this.received);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let received = Arc::clone(&received);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => received.lock().await.extend_from_slice(&buf[..n]),
                        }
                    }
                });
            }
        });
        this
    }

    pub async fn contents(&self) -> Vec<u8> {
        self.received.lock().await.clone()
    }
}

/// Poll-connect to `port` until it accepts or `timeout` elapses.
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("port {port} never came up");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A throw-away CA plus a signed leaf certificate, written to PEM files
/// under `dir` so `TlsConfig` can reference them by path.
pub struct TestCert {
    pub ca_path: std::path::PathBuf,
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
    pub ca: Certificate,
    pub leaf_der: Vec<u8>,
    pub serial: u64,
    _dir: tempfile::TempDir,
}

static NEXT_SERIAL: AtomicUsize = AtomicUsize::new(1);

fn make_ca() -> Certificate {
    let mut params = CertificateParams::new(vec!["test-ca".into()]);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Certificate::from_params(params).unwrap()
}

fn write(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

/// Build a CA and a leaf certificate (with `san_ip` as an IP SAN) signed by
/// it, writing `ca.pem`, `leaf.pem` and `leaf.key` into a fresh temp dir.
pub fn make_leaf_cert(san_ip: IpAddr) -> TestCert {
    let ca = make_ca();
    let ca_pem = ca.serialize_pem().unwrap();

    let serial = NEXT_SERIAL.fetch_add(1, Ordering::SeqCst) as u64;
    let mut params = CertificateParams::new(vec!["leaf".into()]);
    params.subject_alt_names = vec![SanType::IpAddress(san_ip)];
    params.serial_number = Some(rcgen::SerialNumber::from(serial));
    let leaf = Certificate::from_params(params).unwrap();
    let leaf_der = leaf.serialize_der_with_signer(&ca).unwrap();
    let leaf_pem = leaf.serialize_pem_with_signer(&ca).unwrap();
    let key_pem = leaf.serialize_private_key_pem();

    let dir = tempfile::tempdir().unwrap();
    let ca_path = write(dir.path(), "ca.pem", &ca_pem);
    let cert_path = write(dir.path(), "leaf.pem", &leaf_pem);
    let key_path = write(dir.path(), "leaf.key", &key_pem);

    TestCert {
        ca_path,
        cert_path,
        key_path,
        ca,
        leaf_der,
        serial,
        _dir: dir,
    }
}

/// Write a CRL revoking `serials` (signed by `ca`) to a PEM file in the same
/// temp dir as `cert`, returning its path.
pub fn write_crl(cert: &TestCert, serials: &[u64]) -> std::path::PathBuf {
    use rcgen::{
        date_time_ymd, CertificateRevocationList, CertificateRevocationListParams, KeyIdMethod,
        RevokedCertParams, SerialNumber,
    };

    let revoked = serials
        .iter()
        .map(|s| RevokedCertParams {
            serial_number: SerialNumber::from(*s),
            revocation_time: date_time_ymd(2024, 1, 1),
            reason_code: None,
            invalidity_date: None,
        })
        .collect();

    let params = CertificateRevocationListParams {
        this_update: date_time_ymd(2024, 1, 1),
        next_update: date_time_ymd(2999, 1, 1),
        crl_number: SerialNumber::from(1u64),
        issuing_distribution_point: None,
        revoked_certs: revoked,
        alg: &rcgen::PKCS_ECDSA_P256_SHA256,
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = CertificateRevocationList::from_params(params).unwrap();
    let crl_der = crl.serialize_der_with_signer(&cert.ca).unwrap();

    let dir = cert.ca_path.parent().unwrap();
    let path = dir.join("revoked.crl");
    std::fs::write(&path, crl_der).unwrap();
    path
}
