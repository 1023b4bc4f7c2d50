//! Custom peer verifiers layered on top of the webpki default verifiers
//! ("per-ClientHello closure"). Each struct holds the CA pool, cert
//! pair, and CRL path it needs; every verification call is parameter-in,
//! error-out rather than a captured closure.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, Error, RootCertStore, SignatureScheme};

use crate::crl;
use crate::error::ProxyError;

fn crl_error(e: ProxyError) -> Error {
    Error::General(e.to_string())
}

/// Client-role verifier: delegates chain + hostname
/// validation to [`WebPkiServerVerifier`], then CRL-checks the leaf if
/// `crl_path` is configured.
#[derive(Debug)]
pub struct CrlAwareServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    ca_der: CertificateDer<'static>,
    crl_path: Option<PathBuf>,
}

impl CrlAwareServerVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        ca_der: CertificateDer<'static>,
        crl_path: Option<String>,
    ) -> Result<Self, ProxyError> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(CrlAwareServerVerifier {
            inner,
            ca_der,
            crl_path: crl_path.map(PathBuf::from),
        })
    }
}

impl ServerCertVerifier for CrlAwareServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        if let Some(crl_path) = &self.crl_path {
            crl::verify(&self.ca_der, end_entity, crl_path).map_err(crl_error)?;
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Server-role verifier: delegates chain validation to
/// [`WebPkiClientVerifier`], then CRL-checks the leaf if `crl_path` is
/// configured.
///
/// The spec additionally asks for re-verifying the leaf's SAN against the
/// client's remote IP inside this callback. rustls's `ClientCertVerifier`
/// trait has no access to the peer's socket address, so that check is done
/// by the caller immediately after the handshake completes, using
/// [`crate::crl::leaf_matches_remote_ip`] — see `proxy.rs`.
#[derive(Debug)]
pub struct CrlAwareClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    ca_der: CertificateDer<'static>,
    crl_path: Option<PathBuf>,
}

impl CrlAwareClientVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        ca_der: CertificateDer<'static>,
        crl_path: Option<String>,
    ) -> Result<Self, ProxyError> {
        let inner = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(CrlAwareClientVerifier {
            inner,
            ca_der,
            crl_path: crl_path.map(PathBuf::from),
        })
    }
}

impl ClientCertVerifier for CrlAwareClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;

        if let Some(crl_path) = &self.crl_path {
            crl::verify(&self.ca_der, end_entity, crl_path).map_err(crl_error)?;
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
