/// Secure element capability
///
/// This module defines the [`SecureElement`] trait: the raw, object-addressed
/// interface of a tamper-resistant module. Implementations speak to hardware
/// (or emulate it) and know nothing about slots, roles or licensing. Policy
/// lives one layer up, in [`crate::facade`].
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────┐
/// │ Workflows / crypto  │
/// └──────────┬──────────┘
///            │
///            ▼
/// ┌─────────────────────┐
/// │ SecureElementFacade │  ◄─── slot map, bus lock
/// └──────────┬──────────┘
///            │
///            ▼
/// ┌─────────────────────┐
/// │ SecureElement       │  ◄─── Trait (this file)
/// └──────────┬──────────┘
///      ┌─────┴─────┐
///      ▼           ▼
///   Software    Hardware
///   element     driver
/// ```
///
/// # Security Principles
///
/// 1. **Keys never exposed**: private keys never cross this trait
/// 2. **No hidden retries**: every bus fault surfaces as [`SeError::HardwareError`]
/// 3. **Fail secure**: errors never expose key material

use crate::error::SeError;
use crate::slots::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

pub mod software;

pub use p256::ecdsa::{Signature, VerifyingKey};

/// SHA-256 digest.
pub type Digest = [u8; 32];

/// Write budget of a single monotonic counter.
pub const COUNTER_WRITE_BUDGET: u32 = 600_000;

/// Largest version an object's metadata can record (15-bit version tag).
pub const MAX_OBJECT_VERSION: u16 = 0x7FFF;

/// Length of the hardware unique identifier.
pub const UID_LEN: usize = 27;

/// Security level of a secure element implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// Emulated in process memory. **NOT SUITABLE FOR PRODUCTION**
    Software = 0,
    /// Certified tamper-resistant hardware
    HardwareCertified = 1,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Software => write!(f, "Software (Development Only)"),
            SecurityLevel::HardwareCertified => write!(f, "Hardware-Certified"),
        }
    }
}

/// AES key length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AesKeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKeySize {
    pub fn from_bits(bits: u16) -> Result<Self, SeError> {
        match bits {
            128 => Ok(AesKeySize::Aes128),
            192 => Ok(AesKeySize::Aes192),
            256 => Ok(AesKeySize::Aes256),
            other => Err(SeError::InvalidParam(format!(
                "AES key size must be 128, 192 or 256 bits, got {}",
                other
            ))),
        }
    }

    pub fn bits(&self) -> u16 {
        match self {
            AesKeySize::Aes128 => 128,
            AesKeySize::Aes192 => 192,
            AesKeySize::Aes256 => 256,
        }
    }

    pub fn key_len(&self) -> usize {
        self.bits() as usize / 8
    }
}

/// Key material delivered by a protected update.
pub enum KeyMaterial<'a> {
    /// Big-endian P-256 private scalar
    EccP256(&'a [u8]),
    /// Raw AES key of 16, 24 or 32 bytes
    Aes(&'a [u8]),
}

/// Monotonic counter contents.
///
/// Stored on the element as 8 bytes: `[threshold u32 BE][value u32 BE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    pub value: u32,
    pub threshold: u32,
}

impl CounterValue {
    pub const ENCODED_LEN: usize = 8;

    pub fn new(value: u32, threshold: u32) -> Self {
        Self { value, threshold }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SeError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(SeError::HardwareError(format!(
                "counter object has {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let threshold = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let value = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { value, threshold })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.threshold.to_be_bytes());
        out[4..].copy_from_slice(&self.value.to_be_bytes());
        out
    }

    /// Increments left before the threshold is reached.
    pub fn remaining(&self) -> u32 {
        self.threshold.saturating_sub(self.value)
    }
}

/// GlobalPlatform lifecycle state (LcsO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Creation,
    Initialization,
    Operational,
    Termination,
    Unknown(u8),
}

impl LifecycleState {
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x01 => LifecycleState::Creation,
            0x03 => LifecycleState::Initialization,
            0x07 => LifecycleState::Operational,
            0x0F => LifecycleState::Termination,
            other => LifecycleState::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            LifecycleState::Creation => 0x01,
            LifecycleState::Initialization => 0x03,
            LifecycleState::Operational => 0x07,
            LifecycleState::Termination => 0x0F,
            LifecycleState::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Creation => write!(f, "creation"),
            LifecycleState::Initialization => write!(f, "initialization"),
            LifecycleState::Operational => write!(f, "operational"),
            LifecycleState::Termination => write!(f, "termination"),
            LifecycleState::Unknown(v) => write!(f, "unknown(0x{:02X})", v),
        }
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw secure element operations.
///
/// Every method is a single hardware transaction. Implementations must not
/// retry on their own: a failed bus transfer is reported as
/// [`SeError::HardwareError`] and the caller decides.
///
/// Methods take `&mut self` because the element is a single-master serial
/// device. Exclusive access is arranged by
/// [`SecureElementFacade`](crate::facade::SecureElementFacade).
pub trait SecureElement: Send {
    /// Implementation name, for diagnostics.
    fn name(&self) -> &str;

    fn security_level(&self) -> SecurityLevel;

    /// Read the full contents of a data object.
    ///
    /// An object that was never written reads as empty.
    fn read_object(&mut self, object: ObjectId) -> Result<Vec<u8>, SeError>;

    /// Write `data` at `offset`. Offset zero erases the object first.
    fn write_object(&mut self, object: ObjectId, offset: usize, data: &[u8]) -> Result<(), SeError>;

    /// Fill `out` from the true random number generator.
    fn random(&mut self, out: &mut [u8]) -> Result<(), SeError>;

    /// Generate a P-256 keypair in `object`, replacing any previous key.
    fn generate_keypair(&mut self, object: ObjectId) -> Result<VerifyingKey, SeError>;

    /// Public half of the key held in `object`.
    fn public_key(&mut self, object: ObjectId) -> Result<VerifyingKey, SeError>;

    /// ECDSA-sign a SHA-256 digest with the key in `object`.
    fn sign_digest(&mut self, object: ObjectId, digest: &Digest) -> Result<Signature, SeError>;

    /// Verify an ECDSA signature over a digest with a host-supplied key.
    fn verify_digest(
        &mut self,
        key: &VerifyingKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, SeError>;

    /// ECDH between the key in `object` and a peer public key.
    fn ecdh(&mut self, object: ObjectId, peer: &p256::PublicKey) -> Result<Zeroizing<Vec<u8>>, SeError>;

    fn generate_aes_key(&mut self, object: ObjectId, size: AesKeySize) -> Result<(), SeError>;

    fn aes_cbc_encrypt(&mut self, object: ObjectId, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError>;

    fn aes_cbc_decrypt(&mut self, object: ObjectId, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError>;

    /// HMAC-SHA256 keyed by the contents of data object `secret`.
    fn hmac_sha256(&mut self, secret: ObjectId, data: &[u8]) -> Result<[u8; 32], SeError>;

    /// HKDF-SHA256 with the contents of data object `secret` as input key material.
    fn hkdf_sha256(
        &mut self,
        secret: ObjectId,
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SeError>;

    fn sha256(&mut self, data: &[u8]) -> Result<Digest, SeError>;

    /// Install key material delivered by a verified protected update.
    fn install_key(&mut self, object: ObjectId, material: KeyMaterial<'_>) -> Result<(), SeError>;

    fn read_counter(&mut self, counter: ObjectId) -> Result<CounterValue, SeError> {
        let bytes = self.read_object(counter)?;
        CounterValue::from_bytes(&bytes)
    }

    /// Advance a counter by `step`. Fails once the threshold would be exceeded.
    fn increment_counter(&mut self, counter: ObjectId, step: u8) -> Result<CounterValue, SeError>;

    /// Version tag from the metadata of `object`. Never-updated objects report zero.
    fn read_object_version(&mut self, object: ObjectId) -> Result<u16, SeError>;

    /// Record `version` in the metadata of `object` in one transaction.
    ///
    /// The tag survives rewrites of the object's contents. Lowering it fails
    /// with [`SeError::VersionStale`].
    fn write_object_version(&mut self, object: ObjectId, version: u16) -> Result<(), SeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_encoding() {
        let c = CounterValue::new(5, COUNTER_WRITE_BUDGET);
        let bytes = c.to_bytes();
        assert_eq!(&bytes[..4], &COUNTER_WRITE_BUDGET.to_be_bytes());
        assert_eq!(&bytes[4..], &5u32.to_be_bytes());
        assert_eq!(CounterValue::from_bytes(&bytes).unwrap(), c);
        assert_eq!(c.remaining(), COUNTER_WRITE_BUDGET - 5);
        assert!(CounterValue::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_aes_key_size() {
        assert_eq!(AesKeySize::from_bits(192).unwrap().key_len(), 24);
        assert!(AesKeySize::from_bits(512).is_err());
    }

    #[test]
    fn test_lifecycle_state() {
        assert_eq!(LifecycleState::from_byte(0x07), LifecycleState::Operational);
        assert_eq!(LifecycleState::from_byte(0x42), LifecycleState::Unknown(0x42));
        assert_eq!(LifecycleState::Operational.to_string(), "operational");
        assert_eq!(LifecycleState::Termination.as_byte(), 0x0F);
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::Software < SecurityLevel::HardwareCertified);
    }
}
