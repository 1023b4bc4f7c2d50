//! Certificate revocation list checking: given a CA certificate, a
//! candidate leaf certificate, and a CRL file, decide whether the leaf has
//! been revoked.

use std::fs;
use std::path::Path;

use x509_parser::prelude::*;
use x509_parser::time::ASN1Time;

use crate::error::ProxyError;

fn crl_der(raw: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if raw.starts_with(b"-----BEGIN") {
        let (_, pem) =
            parse_x509_pem(raw).map_err(|e| ProxyError::Crl(format!("invalid PEM CRL: {e}")))?;
        Ok(pem.contents)
    } else {
        Ok(raw.to_vec())
    }
}

/// Check `leaf_der` against the CRL at `crl_path`, following the steps of
/// Checked in order: signature, freshness, then revoked-serial lookup.
pub fn verify(ca_der: &[u8], leaf_der: &[u8], crl_path: &Path) -> Result<(), ProxyError> {
    let raw = fs::read(crl_path)
        .map_err(|e| ProxyError::Crl(format!("reading {}: {e}", crl_path.display())))?;
    let der = crl_der(&raw)?;

    let (_, crl) =
        parse_x509_crl(&der).map_err(|e| ProxyError::Crl(format!("invalid CRL: {e}")))?;
    let (_, ca) = parse_x509_certificate(ca_der)
        .map_err(|e| ProxyError::Crl(format!("invalid CA certificate: {e}")))?;

    crl.verify_signature(ca.public_key())
        .map_err(|e| ProxyError::Crl(e.to_string()))?;

    if let Some(next_update) = crl.next_update() {
        if next_update < ASN1Time::now() {
            return Err(ProxyError::Crl("crl file is outdated".to_owned()));
        }
    }

    let (_, leaf) = parse_x509_certificate(leaf_der)
        .map_err(|e| ProxyError::Crl(format!("invalid leaf certificate: {e}")))?;

    if crl.iter_revoked_certificates().any(|r| *r.serial() == leaf.serial) {
        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or("unknown");
        return Err(ProxyError::Crl(format!(
            "certificate was revoked and no longer valid - CN:{cn}"
        )));
    }

    Ok(())
}

/// `true` if any IP-address SAN entry on `leaf_der` matches `remote_ip`
/// (server-role re-verification: "DNSName set to the client's remote
/// IP").
pub fn leaf_matches_remote_ip(leaf_der: &[u8], remote_ip: std::net::IpAddr) -> Result<bool, ProxyError> {
    let (_, leaf) = parse_x509_certificate(leaf_der)
        .map_err(|e| ProxyError::Crl(format!("invalid leaf certificate: {e}")))?;

    let Some(san) = leaf
        .subject_alternative_name()
        .map_err(|e| ProxyError::Crl(format!("invalid SAN extension: {e}")))?
    else {
        return Ok(false);
    };

    let want = match remote_ip {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };

    Ok(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(bytes) if *bytes == want.as_slice())))
}
