//! TLS context builder: turns a validated [`TlsConfig`] plus a role
//! flag into a ready-to-use server or client TLS context, or a "no TLS"
//! marker so the caller falls back to plain TCP.
//!
//! Custom peer verification lives in [`verifier`]; this module wires it up
//! around the webpki default verifiers and loads certs/keys/CA pools from
//! disk.

mod verifier;

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{TlsConfig, TlsMode};
use crate::error::ProxyError;

/// Server-role outcome of the TLS Context Builder: either plain TCP or a
/// ready TLS acceptor.
#[derive(Clone)]
pub enum ServerTlsContext {
    Plain,
    Tls(TlsAcceptor),
}

/// Client-role outcome of the TLS Context Builder.
#[derive(Clone)]
pub enum ClientTlsContext {
    Plain,
    Tls(TlsConnector),
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls(format!("reading {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("parsing {path}: {e}")))
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls(format!("reading {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("parsing {path}: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {path}")))
}

fn load_root_store(ca_cert_path: &str) -> Result<RootCertStore, ProxyError> {
    let der = read_certs(ca_cert_path)?;
    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(der);
    if added == 0 {
        return Err(ProxyError::Tls("can't add CA to pool".to_owned()));
    }
    Ok(store)
}

fn load_key_pair(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let cert_chain = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    Ok((cert_chain, key))
}

/// Build the server-side TLS context for a listener. An absent
/// `tls` means plain TCP.
pub fn build_server(tls: Option<&TlsConfig>) -> Result<ServerTlsContext, ProxyError> {
    let Some(tls) = tls else {
        return Ok(ServerTlsContext::Plain);
    };

    let cert_path = tls
        .cert_path
        .as_deref()
        .ok_or_else(|| ProxyError::Tls("server TLS requires cert".to_owned()))?;
    let key_path = tls
        .key_path
        .as_deref()
        .ok_or_else(|| ProxyError::Tls("server TLS requires key".to_owned()))?;
    let (cert_chain, key) = load_key_pair(cert_path, key_path)
        .map_err(|_| ProxyError::Tls("can't parse public & private key pair for TLS server".to_owned()))?;

    let builder = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13]);

    let config = match tls.mode {
        Some(TlsMode::Mutual) => {
            let ca_cert_path = tls
                .ca_cert_path
                .as_deref()
                .ok_or_else(|| ProxyError::Tls("mutual TLS requires caCert".to_owned()))?;
            let ca_der = read_certs(ca_cert_path)?
                .into_iter()
                .next()
                .ok_or_else(|| ProxyError::Tls("can't add CA to pool".to_owned()))?;
            let root_store = Arc::new(load_root_store(ca_cert_path)?);

            let client_verifier = verifier::CrlAwareClientVerifier::new(root_store, ca_der, tls.crl_path.clone())?;
            builder
                .with_client_cert_verifier(Arc::new(client_verifier))
                .with_single_cert(cert_chain, key)
                .map_err(|e| ProxyError::Tls(e.to_string()))?
        }
        _ => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?,
    };

    Ok(ServerTlsContext::Tls(TlsAcceptor::from(Arc::new(config))))
}

/// Build the client-side TLS context for dialing a target or mirror.
/// An absent `tls` means plain TCP.
pub fn build_client(tls: Option<&TlsConfig>) -> Result<ClientTlsContext, ProxyError> {
    let Some(tls) = tls else {
        return Ok(ClientTlsContext::Plain);
    };

    let ca_cert_path = tls
        .ca_cert_path
        .as_deref()
        .ok_or_else(|| ProxyError::Tls("client TLS requires caCert".to_owned()))?;
    let ca_der = read_certs(ca_cert_path)?
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::Tls("can't add CA to pool".to_owned()))?;
    let root_store = Arc::new(load_root_store(ca_cert_path)?);

    let server_verifier = verifier::CrlAwareServerVerifier::new(root_store, ca_der, tls.crl_path.clone())?;

    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(server_verifier));

    let config = match tls.mode {
        Some(TlsMode::Mutual) => {
            let cert_path = tls
                .cert_path
                .as_deref()
                .ok_or_else(|| ProxyError::Tls("mutual TLS requires cert".to_owned()))?;
            let key_path = tls
                .key_path
                .as_deref()
                .ok_or_else(|| ProxyError::Tls("mutual TLS requires key".to_owned()))?;
            let (cert_chain, key) = load_key_pair(cert_path, key_path).map_err(|_| {
                ProxyError::Tls("can't parse public & private key pair for TLS client".to_owned())
            })?;
            builder
                .with_client_auth_cert(cert_chain, key)
                .map_err(|e| ProxyError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(ClientTlsContext::Tls(TlsConnector::from(Arc::new(config))))
}

/// Resolve the server name to present during a client-role handshake:
/// the configured `sni` if set, otherwise the dial target's host.
pub fn server_name_for(tls: &TlsConfig, host: &str) -> Result<rustls::pki_types::ServerName<'static>, ProxyError> {
    let name = tls.sni.clone().unwrap_or_else(|| host.to_owned());
    rustls::pki_types::ServerName::try_from(name.clone())
        .map(|s| s.to_owned())
        .map_err(|_| ProxyError::Tls(format!("invalid server name {name}")))
}

