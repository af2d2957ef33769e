//! Device attestation and JWT signing
//!
//! # Attestation token
//!
//! A COSE_Sign1-shaped CBOR structure (untagged):
//!
//! ```text
//! [ protected: bstr({1: -7}), unprotected: {}, payload: bstr(claims), signature: bstr(r || s) ]
//! ```
//!
//! The signature is ES256 over the CBOR encoding of
//! `["Signature1", protected, h'', payload]`. Tokens are signed with the
//! identity key, or with the factory key while no identity key exists, so a
//! freshly manufactured device can already attest.
//!
//! # JWT
//!
//! Compact ES256 JWTs with the fixed header `{"alg":"ES256","typ":"JWT"}`.

use crate::device::SecureDevice;
use crate::error::SeError;
use crate::facade::FacadeGuard;
use crate::platform::{Signature, VerifyingKey};
use crate::slots::KeySlot;
use base64::prelude::*;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;

/// Accepted nonce lengths.
pub const NONCE_MIN_LEN: usize = 8;
pub const NONCE_MAX_LEN: usize = 64;

const COSE_ALG: i128 = 1;
const COSE_ES256: i128 = -7;
const JWT_HEADER: &str = r#"{"alg":"ES256","typ":"JWT"}"#;

/// Claims carried by an attestation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationClaims {
    /// Hardware UID
    #[serde(with = "serde_bytes")]
    pub ueid: Vec<u8>,
    pub lifecycle_state: String,
    pub firmware_version: String,
    pub license_status: String,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Issue time, when the clock is synced
    #[serde(default)]
    pub iat: Option<u64>,
}

/// Encoded attestation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationToken {
    bytes: Vec<u8>,
}

fn protected_header() -> Result<Vec<u8>, SeError> {
    let mut map = BTreeMap::new();
    map.insert(Value::Integer(COSE_ALG), Value::Integer(COSE_ES256));
    Ok(serde_cbor::to_vec(&Value::Map(map))?)
}

fn sig_structure_digest(protected: &[u8], payload: &[u8]) -> Result<[u8; 32], SeError> {
    let structure = Value::Array(vec![
        Value::Text("Signature1".to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    Ok(Sha256::digest(serde_cbor::to_vec(&structure)?).into())
}

fn bytes_of(value: &Value, what: &str) -> Result<Vec<u8>, SeError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(SeError::Parse(format!("attestation {} is not a byte string", what))),
    }
}

impl AttestationToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn parts(&self) -> Result<(Vec<u8>, Vec<u8>, Signature), SeError> {
        let value: Value = serde_cbor::from_slice(&self.bytes)?;
        let items = match value {
            Value::Array(items) if items.len() == 4 => items,
            _ => return Err(SeError::Parse("attestation token is not a 4-element array".to_string())),
        };
        let protected = bytes_of(&items[0], "protected header")?;
        let payload = bytes_of(&items[2], "payload")?;
        let signature = Signature::from_slice(&bytes_of(&items[3], "signature")?)
            .map_err(|e| SeError::Parse(format!("attestation signature: {}", e)))?;
        Ok((protected, payload, signature))
    }

    /// Claims without checking the signature.
    pub fn claims_unverified(&self) -> Result<AttestationClaims, SeError> {
        let (_, payload, _) = self.parts()?;
        Ok(serde_cbor::from_slice(&payload)?)
    }

    /// Check the signature with the device public key and return the claims.
    pub fn verify(&self, key: &VerifyingKey) -> Result<AttestationClaims, SeError> {
        let (protected, payload, signature) = self.parts()?;
        if protected != protected_header()? {
            return Err(SeError::SignatureInvalid(
                "unsupported attestation algorithm".to_string(),
            ));
        }
        let digest = sig_structure_digest(&protected, &payload)?;
        key.verify_prehash(&digest, &signature)?;
        Ok(serde_cbor::from_slice(&payload)?)
    }
}

/// Identity key if one was generated, else the factory key.
fn attestation_slot(se: &mut FacadeGuard<'_>) -> Result<KeySlot, SeError> {
    match se.public_key(KeySlot::IDENTITY_KEY) {
        Ok(_) => Ok(KeySlot::IDENTITY_KEY),
        Err(SeError::KeyNotFound(_)) => Ok(KeySlot::FACTORY_KEY),
        Err(e) => Err(e),
    }
}

/// Verify a compact JWT produced by [`SecureDevice::jwt_sign`].
pub fn jwt_verify(token: &str, key: &VerifyingKey) -> Result<serde_json::Value, SeError> {
    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => return Err(SeError::Parse("JWT must have three parts".to_string())),
    };
    if BASE64_URL_SAFE_NO_PAD.decode(header)? != JWT_HEADER.as_bytes() {
        return Err(SeError::SignatureInvalid("unsupported JWT header".to_string()));
    }
    let signature = Signature::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(signature)?)
        .map_err(|e| SeError::Parse(format!("JWT signature: {}", e)))?;
    let digest: [u8; 32] = Sha256::digest(format!("{}.{}", header, payload).as_bytes()).into();
    key.verify_prehash(&digest, &signature)?;
    Ok(serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(payload)?)?)
}

impl SecureDevice {
    /// Produce a signed attestation token binding `nonce` to the device state.
    pub fn attestation_generate(&self, nonce: &[u8]) -> Result<AttestationToken, SeError> {
        let mut se = self.session()?;
        if !(NONCE_MIN_LEN..=NONCE_MAX_LEN).contains(&nonce.len()) {
            return Err(SeError::InvalidParam(format!(
                "nonce must be {}..={} bytes, got {}",
                NONCE_MIN_LEN,
                NONCE_MAX_LEN,
                nonce.len()
            )));
        }

        let claims = AttestationClaims {
            ueid: se.read_uid()?,
            lifecycle_state: se.read_lifecycle()?.to_string(),
            firmware_version: self.firmware_version().to_string(),
            license_status: self.license_status().to_string(),
            nonce: nonce.to_vec(),
            iat: self.time_source().now_unix().ok(),
        };
        let payload = serde_cbor::to_vec(&claims)?;
        let protected = protected_header()?;
        let digest = sig_structure_digest(&protected, &payload)?;

        let slot = attestation_slot(&mut se)?;
        let signature = se.sign(slot, &digest)?;
        log::debug!("attestation token signed with slot {}", slot);

        let token = Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(BTreeMap::new()),
            Value::Bytes(payload),
            Value::Bytes(signature.to_bytes().to_vec()),
        ]);
        Ok(AttestationToken {
            bytes: serde_cbor::to_vec(&token)?,
        })
    }

    /// Sign a JSON object of claims as a compact ES256 JWT.
    pub fn jwt_sign(&self, claims: &serde_json::Value) -> Result<String, SeError> {
        let mut se = self.session()?;
        if !claims.is_object() {
            return Err(SeError::InvalidParam("JWT claims must be a JSON object".to_string()));
        }
        let signing_input = format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(JWT_HEADER),
            BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let digest = se.sha256(signing_input.as_bytes())?;
        let signature = se.sign(KeySlot::IDENTITY_KEY, &digest)?;
        Ok(format!(
            "{}.{}",
            signing_input,
            BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}
