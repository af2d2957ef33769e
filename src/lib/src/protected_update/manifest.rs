//! Signed update manifests
//!
//! On the wire a manifest is a CBOR map `{body: bstr, signature: bstr}`.
//! `body` is itself CBOR and carries the header and payload description; the
//! signature is a raw ES256 `r || s` over SHA-256 of the `body` bytes, made by
//! the key of the device's trust anchor.
//!
//! The payload bytes travel separately as fragments. Confidential payloads are
//! sealed with AES-256-GCM under a key derived by HKDF-SHA256 from the shared
//! update secret held in the reserved slot.

use crate::error::SeError;
use crate::platform::Signature;
use crate::protected_update::bundle::UpdatePackage;
use crate::slots::KeySlot;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Largest encoded manifest.
pub const MAX_MANIFEST_LEN: usize = 1024;
/// Largest single fragment.
pub const MAX_FRAGMENT_LEN: usize = 1024;
/// Most fragments one update may carry.
pub const MAX_FRAGMENTS: usize = 64;

pub const MANIFEST_FORMAT: u8 = 1;
/// COSE algorithm id for ES256.
pub const ALG_ES256: i32 = -7;
pub const ENC_A256GCM: &str = "A256GCM";

/// HKDF info string for payload keys.
pub const UPDATE_KEY_INFO: &[u8] = b"seid protected update v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// What the fragments carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PayloadType {
    /// Raw object contents
    Data = 1,
    /// Private key material for a key slot
    Key = 2,
    /// Object metadata; not supported
    Metadata = 3,
    /// DER certificate
    Cert = 4,
}

impl TryFrom<u8> for PayloadType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PayloadType::Data),
            2 => Ok(PayloadType::Key),
            3 => Ok(PayloadType::Metadata),
            4 => Ok(PayloadType::Cert),
            other => Err(format!("unknown payload type {}", other)),
        }
    }
}

impl From<PayloadType> for u8 {
    fn from(value: PayloadType) -> u8 {
        value as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub format: u8,
    pub algorithm: i32,
}

/// Payload encryption parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encryption {
    pub algorithm: String,
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub target_slot: KeySlot,
    pub version: u32,
    pub payload_type: PayloadType,
    /// SHA-256 of the plaintext payload
    #[serde(with = "serde_bytes")]
    pub content_hash: Vec<u8>,
    pub fragments: u8,
    /// Total length of the delivered (possibly encrypted) fragments
    pub length: u32,
    #[serde(default)]
    pub encryption: Option<Encryption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestBody {
    header: ManifestHeader,
    payload: ManifestPayload,
}

#[derive(Serialize, Deserialize)]
struct SignedManifest {
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

/// A decoded, structurally checked manifest. The signature is not yet verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub header: ManifestHeader,
    pub payload: ManifestPayload,
    body: Vec<u8>,
    signature: Signature,
}

impl Manifest {
    /// Decode and check the structure of an encoded manifest.
    pub fn parse(bytes: &[u8]) -> Result<Self, SeError> {
        if bytes.len() > MAX_MANIFEST_LEN {
            return Err(SeError::InvalidParam(format!(
                "manifest is {} bytes, limit is {}",
                bytes.len(),
                MAX_MANIFEST_LEN
            )));
        }
        let signed: SignedManifest = serde_cbor::from_slice(bytes)?;
        let body: ManifestBody = serde_cbor::from_slice(&signed.body)?;
        let signature = Signature::from_slice(&signed.signature)
            .map_err(|e| SeError::Parse(format!("manifest signature: {}", e)))?;

        if body.header.format != MANIFEST_FORMAT {
            return Err(SeError::Parse(format!(
                "unsupported manifest format {}",
                body.header.format
            )));
        }
        if body.header.algorithm != ALG_ES256 {
            return Err(SeError::Parse(format!(
                "unsupported manifest algorithm {}",
                body.header.algorithm
            )));
        }

        let payload = &body.payload;
        if payload.content_hash.len() != 32 {
            return Err(SeError::Parse("content hash must be 32 bytes".to_string()));
        }
        let fragments = payload.fragments as usize;
        if fragments == 0 || fragments > MAX_FRAGMENTS {
            return Err(SeError::InvalidParam(format!(
                "fragment count {} outside 1..={}",
                fragments, MAX_FRAGMENTS
            )));
        }
        if payload.length as usize > fragments * MAX_FRAGMENT_LEN {
            return Err(SeError::InvalidParam(format!(
                "payload length {} does not fit {} fragments",
                payload.length, fragments
            )));
        }
        if let Some(enc) = &payload.encryption {
            if enc.algorithm != ENC_A256GCM {
                return Err(SeError::Parse(format!(
                    "unsupported payload encryption {}",
                    enc.algorithm
                )));
            }
            if enc.nonce.len() != NONCE_LEN || enc.salt.is_empty() || enc.salt.len() > 64 {
                return Err(SeError::Parse("malformed encryption parameters".to_string()));
            }
        }

        Ok(Self {
            header: body.header,
            payload: body.payload,
            body: signed.body,
            signature,
        })
    }

    /// SHA-256 of the signed body.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.body).into()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

fn associated_data(payload: &ManifestPayload) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[0] = payload.target_slot.0;
    aad[1..].copy_from_slice(&payload.version.to_be_bytes());
    aad
}

/// Open a sealed payload with a key derived from the update secret.
pub(crate) fn decrypt_payload(
    key: &[u8; 32],
    payload: &ManifestPayload,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, SeError> {
    let enc = payload
        .encryption
        .as_ref()
        .ok_or_else(|| SeError::Internal("payload is not encrypted".to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SeError::Internal(format!("AES-GCM key: {}", e)))?;
    let aad = associated_data(payload);
    cipher
        .decrypt(
            Nonce::from_slice(&enc.nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| SeError::SignatureInvalid("payload authentication failed".to_string()))
}

/// Issuer-side construction of a signed update package.
///
/// ```rust,ignore
/// let package = ManifestBuilder::new(KeySlot::DEVICE_CERT, 5, PayloadType::Cert, cert_der)
///     .fragment_size(512)
///     .build(&issuer_key)?;
/// ```
pub struct ManifestBuilder {
    target: KeySlot,
    version: u32,
    payload_type: PayloadType,
    payload: Zeroizing<Vec<u8>>,
    fragment_size: usize,
    secret: Option<Zeroizing<Vec<u8>>>,
}

impl ManifestBuilder {
    pub fn new(target: KeySlot, version: u32, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        Self {
            target,
            version,
            payload_type,
            payload: Zeroizing::new(payload),
            fragment_size: MAX_FRAGMENT_LEN,
            secret: None,
        }
    }

    /// Split the delivered payload into fragments of at most `size` bytes.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Seal the payload with a key derived from the device's update secret.
    pub fn encrypt_with(mut self, update_secret: &[u8]) -> Self {
        self.secret = Some(Zeroizing::new(update_secret.to_vec()));
        self
    }

    pub fn build(&self, signer: &SigningKey) -> Result<UpdatePackage, SeError> {
        if self.fragment_size == 0 || self.fragment_size > MAX_FRAGMENT_LEN {
            return Err(SeError::InvalidParam(format!(
                "fragment size must be 1..={}",
                MAX_FRAGMENT_LEN
            )));
        }
        if self.payload.is_empty() {
            return Err(SeError::InvalidParam("empty payload".to_string()));
        }

        let mut payload = ManifestPayload {
            target_slot: self.target,
            version: self.version,
            payload_type: self.payload_type,
            content_hash: Sha256::digest(self.payload.as_slice()).to_vec(),
            fragments: 0,
            length: 0,
            encryption: None,
        };

        let delivered = match &self.secret {
            None => self.payload.to_vec(),
            Some(secret) => {
                let mut salt = [0u8; SALT_LEN];
                let mut nonce = [0u8; NONCE_LEN];
                getrandom::getrandom(&mut salt)
                    .and_then(|_| getrandom::getrandom(&mut nonce))
                    .map_err(|e| SeError::Internal(format!("RNG failure: {}", e)))?;

                let mut key = Zeroizing::new([0u8; 32]);
                hkdf::Hkdf::<Sha256>::new(Some(&salt[..]), secret)
                    .expand(UPDATE_KEY_INFO, &mut key[..])
                    .map_err(|e| SeError::Internal(format!("HKDF: {}", e)))?;

                payload.encryption = Some(Encryption {
                    algorithm: ENC_A256GCM.to_string(),
                    salt: salt.to_vec(),
                    nonce: nonce.to_vec(),
                });
                let cipher = Aes256Gcm::new_from_slice(&key[..])
                    .map_err(|e| SeError::Internal(format!("AES-GCM key: {}", e)))?;
                let aad = associated_data(&payload);
                cipher
                    .encrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: self.payload.as_slice(),
                            aad: &aad,
                        },
                    )
                    .map_err(|_| SeError::Internal("AES-GCM encryption failed".to_string()))?
            }
        };

        let fragments: Vec<ByteBuf> = delivered
            .chunks(self.fragment_size)
            .map(|c| ByteBuf::from(c.to_vec()))
            .collect();
        if fragments.len() > MAX_FRAGMENTS {
            return Err(SeError::InvalidParam(format!(
                "payload needs {} fragments, limit is {}",
                fragments.len(),
                MAX_FRAGMENTS
            )));
        }
        payload.fragments = fragments.len() as u8;
        payload.length = delivered.len() as u32;

        let body = serde_cbor::to_vec(&ManifestBody {
            header: ManifestHeader {
                format: MANIFEST_FORMAT,
                algorithm: ALG_ES256,
            },
            payload,
        })?;
        let digest = Sha256::digest(&body);
        let signature: Signature = signer.sign_prehash(&digest)?;
        let manifest = serde_cbor::to_vec(&SignedManifest {
            body,
            signature: signature.to_bytes().to_vec(),
        })?;

        if manifest.len() > MAX_MANIFEST_LEN {
            return Err(SeError::InvalidParam(format!(
                "manifest is {} bytes, limit is {}",
                manifest.len(),
                MAX_MANIFEST_LEN
            )));
        }
        Ok(UpdatePackage {
            manifest: ByteBuf::from(manifest),
            fragments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::elliptic_curve::rand_core::OsRng;

    #[test]
    fn test_builder_output_parses_and_verifies() {
        let issuer = SigningKey::random(&mut OsRng);
        let payload = vec![0x5A; 2500];
        let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 7, PayloadType::Cert, payload.clone())
            .build(&issuer)
            .unwrap();

        assert_eq!(package.fragments.len(), 3);
        let manifest = Manifest::parse(&package.manifest).unwrap();
        assert_eq!(manifest.payload.target_slot, KeySlot::CA_CHAIN);
        assert_eq!(manifest.payload.version, 7);
        assert_eq!(manifest.payload.fragments, 3);
        assert_eq!(manifest.payload.length, 2500);
        assert_eq!(manifest.payload.content_hash, Sha256::digest(&payload).to_vec());
        assert!(issuer
            .verifying_key()
            .verify_prehash(&manifest.digest(), manifest.signature())
            .is_ok());
    }

    #[test]
    fn test_encrypted_payload_opens_with_derived_key() {
        let issuer = SigningKey::random(&mut OsRng);
        let secret = [0x11u8; 32];
        let package = ManifestBuilder::new(KeySlot::DEVICE_CERT, 2, PayloadType::Data, b"secret data".to_vec())
            .encrypt_with(&secret)
            .build(&issuer)
            .unwrap();
        let manifest = Manifest::parse(&package.manifest).unwrap();
        let enc = manifest.payload.encryption.clone().unwrap();
        assert_eq!(enc.algorithm, ENC_A256GCM);

        let mut key = [0u8; 32];
        hkdf::Hkdf::<Sha256>::new(Some(enc.salt.as_slice()), &secret)
            .expand(UPDATE_KEY_INFO, &mut key)
            .unwrap();
        let ciphertext: Vec<u8> = package.fragments.iter().flat_map(|f| f.to_vec()).collect();
        let plain = decrypt_payload(&key, &manifest.payload, &ciphertext).unwrap();
        assert_eq!(plain.as_slice(), b"secret data");

        let wrong = [0u8; 32];
        assert!(matches!(
            decrypt_payload(&wrong, &manifest.payload, &ciphertext),
            Err(SeError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_limits() {
        let issuer = SigningKey::random(&mut OsRng);
        let too_many = ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Data, vec![0; 65])
            .fragment_size(1)
            .build(&issuer);
        assert!(matches!(too_many, Err(SeError::InvalidParam(_))));

        assert!(ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Data, vec![0; 4])
            .fragment_size(MAX_FRAGMENT_LEN + 1)
            .build(&issuer)
            .is_err());

        assert!(matches!(
            Manifest::parse(&vec![0u8; MAX_MANIFEST_LEN + 1]),
            Err(SeError::InvalidParam(_))
        ));
        assert!(Manifest::parse(b"\xa0").is_err());
    }

    #[test]
    fn test_payload_type_codes() {
        assert_eq!(PayloadType::try_from(3).unwrap(), PayloadType::Metadata);
        assert_eq!(u8::from(PayloadType::Cert), 4);
        assert!(PayloadType::try_from(9).is_err());
    }
}
