//! License gate
//!
//! A device is licensed when the UID read from its secure element equals the
//! configured UID and the configured license key is a valid issuer signature
//! over that UID. The result is computed by [`LicenseGate::init_license`] and
//! cached; [`LicenseGate::is_licensed`] is a single atomic load.
//!
//! # License format
//!
//! ```text
//! uid = 54 hex characters (27 bytes)
//! key = base64(DER(ECDSA-P256(SHA-256(uid bytes))))
//! ```

use crate::audit;
use crate::config::LicenseConfig;
use crate::error::SeError;
use crate::facade::SecureElementFacade;
use crate::identity::DeviceIdentity;
use base64::prelude::*;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use subtle::ConstantTimeEq;

/// Issuer public key (uncompressed SEC1) trusted by default.
const ISSUER_PUBLIC_KEY_HEX: &str = "04fee231c6652c6c0f05eabcb8fff62c39ce16c5a44f402b4cae735e7f1a3942c92600388a6871f867b31a6c8ccb928fba707fed546a71f067f66d295c309a08a5";

/// Outcome of license verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LicenseStatus {
    /// `init_license` has not run yet
    NotInitialized = 0,
    Valid = 1,
    /// The element's UID differs from the configured UID
    InvalidUid = 2,
    /// The license key is not an issuer signature over the UID
    InvalidSignature = 3,
    /// The configured UID or key could not be decoded
    InvalidFormat = 4,
    /// No UID or key configured
    NotConfigured = 5,
    /// The UID could not be read from the element
    HardwareError = 6,
}

impl LicenseStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LicenseStatus::Valid,
            2 => LicenseStatus::InvalidUid,
            3 => LicenseStatus::InvalidSignature,
            4 => LicenseStatus::InvalidFormat,
            5 => LicenseStatus::NotConfigured,
            6 => LicenseStatus::HardwareError,
            _ => LicenseStatus::NotInitialized,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self == LicenseStatus::Valid
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LicenseStatus::NotInitialized => "not_initialized",
            LicenseStatus::Valid => "valid",
            LicenseStatus::InvalidUid => "invalid_uid",
            LicenseStatus::InvalidSignature => "invalid_signature",
            LicenseStatus::InvalidFormat => "invalid_format",
            LicenseStatus::NotConfigured => "not_configured",
            LicenseStatus::HardwareError => "hardware_error",
        };
        f.write_str(s)
    }
}

/// A license credential: subject UID plus issuer signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    subject: DeviceIdentity,
    signature: Signature,
}

impl License {
    pub fn new(subject: DeviceIdentity, signature: Signature) -> Self {
        Self { subject, signature }
    }

    /// Decode a license from its configured text form.
    pub fn from_text(uid_hex: &str, key_base64: &str) -> Result<Self, SeError> {
        let subject = DeviceIdentity::from_hex(uid_hex)?;
        let der = BASE64_STANDARD.decode(key_base64.trim())?;
        let signature = Signature::from_der(&der)
            .map_err(|e| SeError::Parse(format!("license key is not a DER signature: {}", e)))?;
        Ok(Self { subject, signature })
    }

    /// Issue a license for `subject` (issuer side).
    pub fn issue(issuer: &SigningKey, subject: &DeviceIdentity) -> Result<Self, SeError> {
        let signature: Signature = issuer
            .sign_prehash(&license_digest(subject))
            .map_err(|e| SeError::Internal(format!("license signing failed: {}", e)))?;
        Ok(Self {
            subject: subject.clone(),
            signature,
        })
    }

    pub fn subject(&self) -> &DeviceIdentity {
        &self.subject
    }

    /// Base64 of the DER signature, as placed in configuration.
    pub fn key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.signature.to_der().as_bytes())
    }

    /// Check the signature against an issuer key.
    pub fn verify(&self, issuer: &VerifyingKey) -> bool {
        issuer
            .verify_prehash(&license_digest(&self.subject), &self.signature)
            .is_ok()
    }
}

fn license_digest(subject: &DeviceIdentity) -> [u8; 32] {
    Sha256::digest(subject.uid()).into()
}

/// Process-wide license decision.
///
/// Safe for concurrent readers; `init_license` may be re-run after a hardware
/// reinitialization.
pub struct LicenseGate {
    issuer: VerifyingKey,
    uid: Option<String>,
    key: Option<String>,
    status: AtomicU8,
}

impl LicenseGate {
    /// Build a gate from configuration.
    ///
    /// The embedded issuer key is used unless the configuration overrides it.
    pub fn new(config: &LicenseConfig) -> Result<Self, SeError> {
        let issuer_hex = config
            .issuer_public_key
            .as_deref()
            .unwrap_or(ISSUER_PUBLIC_KEY_HEX);
        let issuer_bytes = hex::decode(issuer_hex.trim())
            .map_err(|e| SeError::Parse(format!("issuer public key is not hex: {}", e)))?;
        let issuer = VerifyingKey::from_sec1_bytes(&issuer_bytes)
            .map_err(|e| SeError::Parse(format!("issuer public key is invalid: {}", e)))?;

        let non_empty = |s: &Option<String>| s.as_ref().filter(|v| !v.trim().is_empty()).cloned();
        Ok(Self {
            issuer,
            uid: non_empty(&config.uid),
            key: non_empty(&config.key),
            status: AtomicU8::new(LicenseStatus::NotInitialized as u8),
        })
    }

    /// Verify the license against the element and cache the result.
    pub fn init_license(&self, facade: &SecureElementFacade) -> LicenseStatus {
        let uid = facade.acquire().and_then(|mut se| se.read_uid());
        self.init_with_uid(uid)
    }

    /// Verify against a UID already read from the element.
    pub(crate) fn init_with_uid(&self, uid: Result<Vec<u8>, SeError>) -> LicenseStatus {
        let status = self.evaluate(uid);
        self.status.store(status as u8, Ordering::SeqCst);

        let subject = self.uid.as_deref().unwrap_or("unconfigured");
        if status.is_valid() {
            log::info!("License verified for {}", subject);
            audit::log_license_verified(subject);
        } else {
            log::warn!("License verification failed: {}", status);
            audit::log_license_rejected(subject, &status.to_string());
        }
        status
    }

    fn evaluate(&self, uid: Result<Vec<u8>, SeError>) -> LicenseStatus {
        let (configured_uid, key) = match (&self.uid, &self.key) {
            (Some(uid), Some(key)) => (uid, key),
            _ => return LicenseStatus::NotConfigured,
        };
        let license = match License::from_text(configured_uid, key) {
            Ok(license) => license,
            Err(_) => return LicenseStatus::InvalidFormat,
        };

        let actual = match uid {
            Ok(uid) => uid,
            Err(e) => {
                log::warn!("Failed to read UID: {}", e);
                return LicenseStatus::HardwareError;
            }
        };

        if !bool::from(actual.as_slice().ct_eq(license.subject().uid())) {
            return LicenseStatus::InvalidUid;
        }
        if !license.verify(&self.issuer) {
            return LicenseStatus::InvalidSignature;
        }
        LicenseStatus::Valid
    }

    pub fn is_licensed(&self) -> bool {
        self.status().is_valid()
    }

    pub fn status(&self) -> LicenseStatus {
        LicenseStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Fail with [`SeError::NotLicensed`] unless the gate is open.
    pub fn ensure_licensed(&self) -> Result<(), SeError> {
        if self.is_licensed() {
            Ok(())
        } else {
            Err(SeError::NotLicensed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::software::SoftwareSecureElement;
    use crate::platform::UID_LEN;
    use crate::slots::SlotMap;
    use p256::elliptic_curve::rand_core::OsRng;

    const UID: [u8; UID_LEN] = [0x5A; UID_LEN];

    fn facade() -> SecureElementFacade {
        let se = SoftwareSecureElement::with_uid(&UID).expect("Failed to create element");
        SecureElementFacade::new(Box::new(se), SlotMap::default()).expect("Failed to create facade")
    }

    fn config_for(issuer: &SigningKey, uid: &[u8]) -> LicenseConfig {
        let subject = DeviceIdentity::from_uid(uid).unwrap();
        let license = License::issue(issuer, &subject).unwrap();
        LicenseConfig {
            uid: Some(subject.to_hex()),
            key: Some(license.key_base64()),
            issuer_public_key: Some(hex::encode(
                issuer.verifying_key().to_encoded_point(false).as_bytes(),
            )),
        }
    }

    #[test]
    fn test_embedded_issuer_key_parses() {
        let gate = LicenseGate::new(&LicenseConfig::default()).unwrap();
        assert_eq!(gate.status(), LicenseStatus::NotInitialized);
        assert!(!gate.is_licensed());
    }

    #[test]
    fn test_valid_license() {
        let issuer = SigningKey::random(&mut OsRng);
        let gate = LicenseGate::new(&config_for(&issuer, &UID)).unwrap();
        assert_eq!(gate.init_license(&facade()), LicenseStatus::Valid);
        assert!(gate.is_licensed());
        assert!(gate.ensure_licensed().is_ok());
    }

    #[test]
    fn test_uid_mismatch() {
        let issuer = SigningKey::random(&mut OsRng);
        let gate = LicenseGate::new(&config_for(&issuer, &[0x01; UID_LEN])).unwrap();
        assert_eq!(gate.init_license(&facade()), LicenseStatus::InvalidUid);
        assert!(matches!(gate.ensure_licensed(), Err(SeError::NotLicensed)));
    }

    #[test]
    fn test_wrong_issuer() {
        let issuer = SigningKey::random(&mut OsRng);
        let impostor = SigningKey::random(&mut OsRng);
        let mut config = config_for(&impostor, &UID);
        config.issuer_public_key = Some(hex::encode(
            issuer.verifying_key().to_encoded_point(false).as_bytes(),
        ));
        let gate = LicenseGate::new(&config).unwrap();
        assert_eq!(gate.init_license(&facade()), LicenseStatus::InvalidSignature);
    }

    #[test]
    fn test_not_configured_and_bad_format() {
        let gate = LicenseGate::new(&LicenseConfig::default()).unwrap();
        assert_eq!(gate.init_license(&facade()), LicenseStatus::NotConfigured);

        let config = LicenseConfig {
            uid: Some(hex::encode(UID)),
            key: Some("not base64!".to_string()),
            issuer_public_key: None,
        };
        let gate = LicenseGate::new(&config).unwrap();
        assert_eq!(gate.init_license(&facade()), LicenseStatus::InvalidFormat);
    }

    #[test]
    fn test_hardware_error() {
        let issuer = SigningKey::random(&mut OsRng);
        let se = SoftwareSecureElement::with_uid(&UID).unwrap();
        se.probe().set_offline(true);
        let facade = SecureElementFacade::new(Box::new(se), SlotMap::default()).unwrap();
        let gate = LicenseGate::new(&config_for(&issuer, &UID)).unwrap();
        assert_eq!(gate.init_license(&facade), LicenseStatus::HardwareError);
    }

    #[test]
    fn test_reinit_recovers_after_fault() {
        let issuer = SigningKey::random(&mut OsRng);
        let se = SoftwareSecureElement::with_uid(&UID).unwrap();
        let probe = se.probe();
        let facade = SecureElementFacade::new(Box::new(se), SlotMap::default()).unwrap();
        let gate = LicenseGate::new(&config_for(&issuer, &UID)).unwrap();

        probe.set_offline(true);
        assert_eq!(gate.init_license(&facade), LicenseStatus::HardwareError);
        probe.set_offline(false);
        assert_eq!(gate.init_license(&facade), LicenseStatus::Valid);
    }

    #[test]
    fn test_license_text_roundtrip() {
        let issuer = SigningKey::random(&mut OsRng);
        let subject = DeviceIdentity::from_uid(&UID).unwrap();
        let license = License::issue(&issuer, &subject).unwrap();
        let parsed = License::from_text(&subject.to_hex(), &license.key_base64()).unwrap();
        assert_eq!(parsed, license);
        assert!(parsed.verify(issuer.verifying_key()));
    }
}
