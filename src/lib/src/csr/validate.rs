//! Issued certificate validation
//!
//! A certificate returned by the backend is accepted only when:
//!
//! 1. its subject CN equals the device identity,
//! 2. its public key is the key the CSR was built for,
//! 3. it is signed by one of the known issuers (ECDSA P-256 / SHA-256),
//! 4. it is within its validity window, when the clock can be trusted.

use crate::error::SeError;
use crate::platform::{Signature, VerifyingKey};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::oid_registry::OID_SIG_ECDSA_WITH_SHA256;

/// Largest certificate accepted from the backend.
pub const MAX_CERTIFICATE_LEN: usize = 2048;

/// A certificate that passed [`validate_certificate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCertificate {
    pub der: Vec<u8>,
    pub subject_cn: String,
    /// Unix seconds
    pub not_after: i64,
    /// Lowercase hex SHA-256 of the DER
    pub fingerprint: String,
}

/// Accept a PEM or DER certificate and return the DER bytes.
pub fn certificate_der(bytes: &[u8]) -> Result<Vec<u8>, SeError> {
    if bytes.len() > MAX_CERTIFICATE_LEN * 2 {
        return Err(SeError::Certificate(format!(
            "certificate payload of {} bytes is too large",
            bytes.len()
        )));
    }
    let der = if bytes.starts_with(b"-----BEGIN") {
        let parsed = pem::parse(bytes)
            .map_err(|e| SeError::Certificate(format!("invalid PEM: {}", e)))?;
        if parsed.tag() != "CERTIFICATE" {
            return Err(SeError::Certificate(format!(
                "expected CERTIFICATE, got {}",
                parsed.tag()
            )));
        }
        parsed.into_contents()
    } else {
        bytes.to_vec()
    };
    if der.len() > MAX_CERTIFICATE_LEN {
        return Err(SeError::Certificate(format!(
            "certificate is {} bytes, limit is {}",
            der.len(),
            MAX_CERTIFICATE_LEN
        )));
    }
    Ok(der)
}

/// Split concatenated DER certificates.
pub fn split_certificates(mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, SeError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (rest, _) = x509_parser::parse_x509_certificate(bytes)?;
        let len = bytes.len() - rest.len();
        out.push(bytes[..len].to_vec());
        bytes = rest;
    }
    Ok(out)
}

fn issuer_signature_ok(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Result<bool, SeError> {
    if cert.signature_algorithm.algorithm != OID_SIG_ECDSA_WITH_SHA256 {
        return Err(SeError::Certificate(format!(
            "unsupported signature algorithm {}",
            cert.signature_algorithm.algorithm
        )));
    }
    let key = match VerifyingKey::from_sec1_bytes(&issuer.public_key().subject_public_key.data) {
        Ok(key) => key,
        Err(_) => return Ok(false),
    };
    let signature = match Signature::from_der(&cert.signature_value.data) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    let digest = Sha256::digest(cert.tbs_certificate.as_ref());
    Ok(key.verify_prehash(&digest, &signature).is_ok())
}

/// Check `der` against the expectations of a CSR round.
pub fn validate_certificate(
    der: &[u8],
    expected_cn: &str,
    expected_key: &VerifyingKey,
    issuers: &[Vec<u8>],
    now_unix: Option<u64>,
) -> Result<ValidatedCertificate, SeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)?;

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| SeError::Certificate("certificate has no common name".to_string()))?
        .to_string();
    if !subject_cn.eq_ignore_ascii_case(expected_cn) {
        return Err(SeError::Certificate(format!(
            "subject {} does not match device identity",
            subject_cn
        )));
    }

    let expected_point = expected_key.to_encoded_point(false);
    if cert.public_key().subject_public_key.data.as_ref() != expected_point.as_bytes() {
        return Err(SeError::Certificate(
            "certificate key is not the generated key".to_string(),
        ));
    }

    let mut name_matched = false;
    let mut chained = false;
    for issuer_der in issuers {
        let (_, issuer) = x509_parser::parse_x509_certificate(issuer_der)?;
        if issuer.subject().as_raw() == cert.issuer().as_raw() {
            name_matched = true;
        }
        if issuer_signature_ok(&cert, &issuer)? {
            chained = true;
            break;
        }
    }
    if !chained {
        return Err(if name_matched {
            SeError::SignatureInvalid("certificate signature does not verify".to_string())
        } else {
            SeError::Certificate("certificate does not chain to a known issuer".to_string())
        });
    }

    let validity = cert.validity();
    if let Some(now) = now_unix {
        let now = now as i64;
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return Err(SeError::Certificate(
                "certificate is outside its validity period".to_string(),
            ));
        }
    }

    Ok(ValidatedCertificate {
        der: der.to_vec(),
        subject_cn,
        not_after: validity.not_after.timestamp(),
        fingerprint: hex::encode(Sha256::digest(der)),
    })
}
