//! Nothing reaches the secure element while the license gate is closed.

mod common;

use seid::csr::CsrWorkflow;
use seid::license::LicenseStatus;
use seid::protected_update::UpdateWorkflow;
use seid::slots::{CounterId, KeySlot};
use seid::transport::LoopbackTransport;
use seid::SeError;

fn assert_gated<T: std::fmt::Debug>(result: Result<T, SeError>) {
    match result {
        Err(SeError::NotLicensed) => {}
        other => panic!("expected NotLicensed, got {:?}", other),
    }
}

#[test]
fn test_every_operation_refused() {
    let fx = common::unlicensed();
    assert_eq!(fx.device.license_status(), LicenseStatus::InvalidSignature);
    let writes = fx.probe.writes();
    let device = &fx.device;

    assert_gated(device.random(32));
    assert_gated(device.hash(b"data"));
    assert_gated(device.aes_generate_key(256));
    assert_gated(device.aes_encrypt(&[0; 16], None));
    assert_gated(device.aes_decrypt(&[0; 16], &[0; 16]));
    assert_gated(device.hmac_sha256(KeySlot(0), b"data"));
    assert_gated(device.hkdf_derive(KeySlot(0), b"salt", b"info", 32));
    assert_gated(device.sign_data(KeySlot::FACTORY_KEY, b"data"));
    assert_gated(device.generate_keypair(KeySlot::APP_KEY));
    assert_gated(device.public_key(KeySlot::FACTORY_KEY));
    assert_gated(device.secure_store_write(KeySlot(0), b"secret"));
    assert_gated(device.secure_store_read(KeySlot(0)));
    assert_gated(device.counter_read(CounterId::MESSAGE_SEQUENCE));
    assert_gated(device.counter_increment(CounterId::MESSAGE_SEQUENCE, 1));
    assert_gated(device.attestation_generate(&[7; 16]));
    assert_gated(device.jwt_sign(&serde_json::json!({"sub": "device"})));
    assert_gated(device.health_check(None));
    assert_gated(device.session().map(drop));

    assert_eq!(fx.probe.writes(), writes);
}

#[test]
fn test_workflows_refuse_to_start() {
    let fx = common::unlicensed();
    let writes = fx.probe.writes();

    let mut csr = CsrWorkflow::new(&fx.device, LoopbackTransport::new())
        .expect("Failed to create workflow")
        .with_sleeper(common::no_sleep());
    assert_gated(csr.start());
    assert_gated(csr.run());

    let mut update = UpdateWorkflow::new(&fx.device, LoopbackTransport::new())
        .expect("Failed to create workflow")
        .with_sleeper(common::no_sleep());
    assert_gated(update.start());
    assert_gated(update.start_bootstrap());
    assert_gated(update.run(false));

    assert_eq!(fx.probe.writes(), writes);
}

#[test]
fn test_gate_opens_with_valid_license() {
    let fx = common::licensed();
    assert!(fx.device.is_licensed());
    assert_eq!(fx.device.random(32).expect("random failed").len(), 32);

    // a UID mismatch keeps the gate closed even with a genuine issuer signature
    let issuer = fx.license_issuer;
    let config = common::licensed_config(&issuer);
    let mut other_uid = common::UID;
    other_uid[0] ^= 0xFF;
    let element = seid::platform::software::SoftwareSecureElement::with_uid(&other_uid)
        .expect("Failed to create element");
    let other = common::open(element, config, issuer);
    assert_eq!(other.device.license_status(), LicenseStatus::InvalidUid);
    assert_gated(other.device.random(32));
}

#[test]
fn test_unconfigured_license() {
    let issuer = p256::ecdsa::SigningKey::random(&mut p256::elliptic_curve::rand_core::OsRng);
    let mut config = common::licensed_config(&issuer);
    config.license.key = None;
    let element = seid::platform::software::SoftwareSecureElement::with_uid(&common::UID)
        .expect("Failed to create element");
    let fx = common::open(element, config, issuer);
    assert_eq!(fx.device.license_status(), LicenseStatus::NotConfigured);
    assert_gated(fx.device.hash(b"x"));
}
