//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use seid::config::DeviceConfig;
use seid::device::SecureDevice;
use seid::license::License;
use seid::platform::software::{SoftwareProbe, SoftwareSecureElement};
use seid::platform::UID_LEN;
use seid::DeviceIdentity;
use std::sync::Arc;

pub const UID: [u8; UID_LEN] = [
    0xCD, 0x16, 0x33, 0x82, 0x01, 0x00, 0x1C, 0x00, 0x05, 0x00, 0x00, 0x0A, 0x09, 0x1B, 0x5C,
    0x00, 0x07, 0x00, 0x6A, 0x00, 0x21, 0x80, 0x01, 0x01, 0x01, 0x01, 0x00,
];

pub struct Fixture {
    pub device: SecureDevice,
    pub probe: Arc<SoftwareProbe>,
    pub license_issuer: SigningKey,
}

/// Config carrying a license for [`UID`] signed by `issuer`.
pub fn licensed_config(issuer: &SigningKey) -> DeviceConfig {
    let identity = DeviceIdentity::from_uid(&UID).expect("Failed to build identity");
    let license = License::issue(issuer, &identity).expect("Failed to issue license");

    let mut config = DeviceConfig::default();
    config.license.uid = Some(identity.to_hex());
    config.license.key = Some(license.key_base64());
    config.license.issuer_public_key = Some(hex::encode(
        issuer.verifying_key().to_encoded_point(false).as_bytes(),
    ));
    config.csr.backoff_ms = 0;
    config
}

pub fn open(element: SoftwareSecureElement, config: DeviceConfig, issuer: SigningKey) -> Fixture {
    let probe = element.probe();
    let device = SecureDevice::new(Box::new(element), config).expect("Failed to open device");
    device.init();
    Fixture {
        device,
        probe,
        license_issuer: issuer,
    }
}

pub fn licensed() -> Fixture {
    let issuer = SigningKey::random(&mut OsRng);
    let element = SoftwareSecureElement::with_uid(&UID).expect("Failed to create element");
    open(element, licensed_config(&issuer), issuer)
}

/// A device whose license was signed by someone other than the configured issuer.
pub fn unlicensed() -> Fixture {
    let issuer = SigningKey::random(&mut OsRng);
    let mut config = licensed_config(&issuer);
    let other = SigningKey::random(&mut OsRng);
    config.license.issuer_public_key = Some(hex::encode(
        other.verifying_key().to_encoded_point(false).as_bytes(),
    ));
    let element = SoftwareSecureElement::with_uid(&UID).expect("Failed to create element");
    open(element, config, issuer)
}

pub fn no_sleep() -> seid::workflow::Sleeper {
    Box::new(|_| {})
}
