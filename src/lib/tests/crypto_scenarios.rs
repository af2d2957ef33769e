//! Crypto utilities and bus exclusivity on a licensed device.

mod common;

use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::EncodePublicKey;
use seid::attestation::jwt_verify;
use seid::facade::VerifyKey;
use seid::protected_update::{ManifestBuilder, PayloadType, UpdateWorkflow};
use seid::slots::{CounterId, KeySlot};
use seid::transport::LoopbackTransport;
use seid::SeError;
use std::time::Duration;

#[test]
fn test_aes_requires_whole_blocks() {
    let fx = common::licensed();
    fx.device.aes_generate_key(256).expect("Failed to generate AES key");

    let writes = fx.probe.writes();
    assert!(matches!(
        fx.device.aes_encrypt(&[0x41; 15], None),
        Err(SeError::InvalidParam(_))
    ));
    assert_eq!(fx.probe.writes(), writes);

    let plaintext = [0x41; 48];
    let sealed = fx.device.aes_encrypt(&plaintext, None).expect("Failed to encrypt");
    assert_eq!(sealed.ciphertext.len(), 48);
    assert_ne!(sealed.ciphertext, plaintext.to_vec());
    let opened = fx
        .device
        .aes_decrypt(&sealed.ciphertext, &sealed.iv)
        .expect("Failed to decrypt");
    assert_eq!(opened, plaintext.to_vec());
}

#[test]
fn test_ecdh_matches_peer() {
    let fx = common::licensed();
    let device_public = fx
        .device
        .generate_keypair(KeySlot::APP_KEY)
        .expect("Failed to generate session key");

    let peer = p256::SecretKey::random(&mut OsRng);
    let ours = fx
        .device
        .ecdh_shared_secret(KeySlot::APP_KEY, &peer.public_key())
        .expect("ECDH failed");
    let theirs = p256::ecdh::diffie_hellman(
        peer.to_nonzero_scalar(),
        p256::PublicKey::from(&device_public).as_affine(),
    );
    assert_eq!(ours.as_slice(), theirs.raw_secret_bytes().as_slice());

    assert!(matches!(
        fx.device.ecdh_shared_secret(KeySlot::FACTORY_KEY, &peer.public_key()),
        Err(SeError::InvalidParam(_))
    ));
}

#[test]
fn test_sign_verify_and_tokens() {
    let fx = common::licensed();
    let signature = fx
        .device
        .sign_data(KeySlot::FACTORY_KEY, b"telemetry")
        .expect("Failed to sign");
    assert!(fx
        .device
        .verify_data(VerifyKey::Slot(KeySlot::FACTORY_KEY), b"telemetry", &signature)
        .expect("Failed to verify"));
    assert!(!fx
        .device
        .verify_data(VerifyKey::Slot(KeySlot::FACTORY_KEY), b"telemetrY", &signature)
        .expect("Failed to verify"));

    // no identity key yet: tokens fall back to the factory key
    let factory = fx.device.public_key(KeySlot::FACTORY_KEY).expect("No factory key");
    let token = fx.device.attestation_generate(&[0xAB; 16]).expect("Failed to attest");
    let claims = token.verify(&factory).expect("Attestation does not verify");
    assert_eq!(claims.ueid, common::UID.to_vec());
    assert_eq!(claims.nonce, vec![0xAB; 16]);
    assert!(matches!(
        fx.device.attestation_generate(&[1; 4]),
        Err(SeError::InvalidParam(_))
    ));

    let identity = fx
        .device
        .generate_keypair(KeySlot::IDENTITY_KEY)
        .expect("Failed to generate identity key");
    let jwt = fx
        .device
        .jwt_sign(&serde_json::json!({"sub": "seid", "n": 1}))
        .expect("Failed to sign JWT");
    let claims = jwt_verify(&jwt, &identity).expect("JWT does not verify");
    assert_eq!(claims["sub"], "seid");
    assert!(jwt_verify(&jwt, &factory).is_err());
}

#[test]
fn test_counters_are_monotonic() {
    let fx = common::licensed();
    let start = fx
        .device
        .counter_read(CounterId::MESSAGE_SEQUENCE)
        .expect("Failed to read counter")
        .value;
    let after = fx
        .device
        .counter_increment(CounterId::MESSAGE_SEQUENCE, 3)
        .expect("Failed to increment");
    assert_eq!(after.value, start + 3);
    assert!(fx.device.counter_increment(CounterId::MESSAGE_SEQUENCE, 0).is_err());
    assert!(CounterId::new(CounterId::COUNT).is_err());
}

#[test]
fn test_health_check_waits_for_update_to_finish() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    let spki = signer
        .verifying_key()
        .to_public_key_der()
        .expect("Failed to encode SPKI");
    fx.device
        .session()
        .expect("Failed to open session")
        .write(KeySlot::TRUST_ANCHOR, spki.as_bytes())
        .expect("Failed to provision trust anchor");

    let key = rcgen::KeyPair::generate().expect("Failed to generate key");
    let mut params = rcgen::CertificateParams::new(vec!["device.local".to_string()])
        .expect("Failed to build params");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "device");
    let certificate = params.self_signed(&key).expect("Failed to self-sign").der().to_vec();

    let package = ManifestBuilder::new(KeySlot::DEVICE_CERT, 1, PayloadType::Cert, certificate.clone())
        .fragment_size(64)
        .build(&signer)
        .expect("Failed to build package");
    assert!(package.fragments.len() >= 4);

    let transport = LoopbackTransport::new();
    let mut workflow = UpdateWorkflow::new(&fx.device, transport.clone())
        .expect("Failed to create workflow")
        .with_sleeper(common::no_sleep());
    transport
        .push(
            &workflow.channels().protected_update,
            package.to_cbor().expect("Failed to encode package"),
        )
        .expect("Failed to queue package");

    let before = fx.probe.writes();
    fx.probe.set_write_delay(Duration::from_millis(25));

    let report = std::thread::scope(|scope| {
        let updater = scope.spawn(|| workflow.run(false));

        // first fragment is down, so the update holds the bus
        while fx.probe.writes() == before {
            std::thread::sleep(Duration::from_millis(1));
        }
        let report = fx.device.health_check(None).expect("Health check failed");

        updater
            .join()
            .expect("Updater panicked")
            .expect("Update failed");
        report
    });

    assert!(report.device_cert_ok);
    let stored = fx
        .device
        .session()
        .expect("Failed to open session")
        .read_vec(KeySlot::DEVICE_CERT)
        .expect("Failed to read device certificate");
    assert_eq!(stored, certificate);
}
