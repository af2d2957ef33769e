//! Protected updates end to end over the loopback transport.

mod common;

use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::EncodePublicKey;
use seid::protected_update::{
    JsonBundle, ManifestBuilder, PayloadType, UpdatePackage, UpdateState, UpdateWorkflow,
};
use seid::platform::MAX_OBJECT_VERSION;
use seid::slots::KeySlot;
use seid::transport::LoopbackTransport;
use seid::SeError;
use serde_bytes::ByteBuf;

fn provision_anchor(fx: &common::Fixture, signer: &SigningKey) {
    let spki = signer
        .verifying_key()
        .to_public_key_der()
        .expect("Failed to encode SPKI");
    fx.device
        .session()
        .expect("Failed to open session")
        .write(KeySlot::TRUST_ANCHOR, spki.as_bytes())
        .expect("Failed to provision trust anchor");
}

fn deliver(fx: &common::Fixture, package: &UpdatePackage) -> (Result<(KeySlot, u32), SeError>, LoopbackTransport) {
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
    (workflow.run(false), transport)
}

fn last_ack(fx: &common::Fixture, transport: &LoopbackTransport) -> serde_json::Value {
    let channels = seid::transport::Channels::for_identity(fx.device.identity().expect("No identity"));
    let acks = transport.published(&channels.ack).expect("Failed to read acks");
    let last = acks.last().expect("No acknowledgement published");
    serde_json::from_slice(last).expect("Ack is not JSON")
}

fn read(fx: &common::Fixture, slot: KeySlot) -> Vec<u8> {
    fx.device
        .session()
        .expect("Failed to open session")
        .read_vec(slot)
        .expect("Failed to read slot")
}

fn version(fx: &common::Fixture, slot: KeySlot) -> u32 {
    fx.device.update_version(slot).expect("Failed to read version")
}

#[test]
fn test_tampered_fragment_rejected_without_writes() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let payload: Vec<u8> = (0..900u32).map(|i| (i % 251) as u8).collect();
    let mut package = ManifestBuilder::new(KeySlot::CA_CHAIN, 2, PayloadType::Cert, payload)
        .fragment_size(300)
        .build(&signer)
        .expect("Failed to build package");
    let mut fragment = package.fragments[1].to_vec();
    fragment[17] ^= 0x01;
    package.fragments[1] = ByteBuf::from(fragment);

    let writes = fx.probe.writes();
    let (result, transport) = deliver(&fx, &package);
    match result {
        Err(SeError::SignatureInvalid(msg)) => assert!(msg.contains("content hash")),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(fx.probe.writes(), writes);
    assert!(read(&fx, KeySlot::CA_CHAIN).is_empty());
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 0);

    let ack = last_ack(&fx, &transport);
    assert_eq!(ack["status"], "error");
    assert_eq!(ack["code"], -109);
}

#[test]
fn test_rollback_refused() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let v5 = ManifestBuilder::new(KeySlot::CA_CHAIN, 5, PayloadType::Cert, vec![0x55; 200])
        .build(&signer)
        .expect("Failed to build v5");
    let (result, _) = deliver(&fx, &v5);
    assert_eq!(result.expect("v5 rejected"), (KeySlot::CA_CHAIN, 5));
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 5);

    let v3 = ManifestBuilder::new(KeySlot::CA_CHAIN, 3, PayloadType::Cert, vec![0x33; 200])
        .build(&signer)
        .expect("Failed to build v3");
    let writes = fx.probe.writes();
    let (result, transport) = deliver(&fx, &v3);
    assert!(matches!(
        result,
        Err(SeError::VersionStale {
            current: 5,
            offered: 3
        })
    ));
    assert_eq!(fx.probe.writes(), writes);
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), vec![0x55; 200]);
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 5);
    assert_eq!(last_ack(&fx, &transport)["code"], -110);

    // same version re-applies
    let again = ManifestBuilder::new(KeySlot::CA_CHAIN, 5, PayloadType::Cert, vec![0x56; 10])
        .build(&signer)
        .expect("Failed to build");
    assert!(deliver(&fx, &again).0.is_ok());
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 5);
}

#[test]
fn test_any_signature_corruption_rejected() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let package = ManifestBuilder::new(KeySlot::DEVICE_CERT, 1, PayloadType::Cert, vec![9; 64])
        .build(&signer)
        .expect("Failed to build package");
    let len = package.manifest.len();
    let writes = fx.probe.writes();

    // the signature is the trailing bytes of the manifest encoding
    for offset in [1, 10, 33, 63] {
        let mut tampered = package.clone();
        let mut manifest = tampered.manifest.to_vec();
        manifest[len - offset] ^= 0x80;
        tampered.manifest = ByteBuf::from(manifest);
        let (result, _) = deliver(&fx, &tampered);
        assert!(
            matches!(result, Err(SeError::SignatureInvalid(_)) | Err(SeError::Parse(_))),
            "offset {}: {:?}",
            offset,
            result
        );
    }
    assert_eq!(fx.probe.writes(), writes);
    assert_eq!(version(&fx, KeySlot::DEVICE_CERT), 0);
}

#[test]
fn test_bootstrap_bundle_then_signer_pinned() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    let spki = signer
        .verifying_key()
        .to_public_key_der()
        .expect("Failed to encode SPKI")
        .as_bytes()
        .to_vec();

    let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Cert, vec![0xCA; 600])
        .fragment_size(256)
        .build(&signer)
        .expect("Failed to build package");
    let bundle = JsonBundle {
        signing_certificate: spki.clone(),
        package,
    };

    let transport = LoopbackTransport::new();
    let mut workflow = UpdateWorkflow::new(&fx.device, transport.clone())
        .expect("Failed to create workflow")
        .with_sleeper(common::no_sleep());
    let channel = workflow.channels().trust_anchor.clone();
    transport
        .push(&channel, bundle.to_json().expect("Failed to encode").into_bytes())
        .expect("Failed to queue bundle");
    assert_eq!(workflow.run(true).expect("Bootstrap failed"), (KeySlot::CA_CHAIN, 1));
    assert_eq!(read(&fx, KeySlot::TRUST_ANCHOR), spki);
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), vec![0xCA; 600]);

    // a second bundle from a different signer cannot replace the anchor
    let intruder = SigningKey::random(&mut OsRng);
    let rogue = JsonBundle {
        signing_certificate: intruder
            .verifying_key()
            .to_public_key_der()
            .expect("Failed to encode SPKI")
            .as_bytes()
            .to_vec(),
        package: ManifestBuilder::new(KeySlot::CA_CHAIN, 2, PayloadType::Cert, vec![0xBA; 16])
            .build(&intruder)
            .expect("Failed to build package"),
    };
    transport
        .push(&channel, rogue.to_json().expect("Failed to encode").into_bytes())
        .expect("Failed to queue bundle");
    assert!(matches!(workflow.run(true), Err(SeError::SignatureInvalid(_))));
    assert!(matches!(workflow.state(), UpdateState::Error(_)));
    assert_eq!(read(&fx, KeySlot::TRUST_ANCHOR), spki);
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), vec![0xCA; 600]);
}

#[test]
fn test_encrypted_update_after_secret_provisioning() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let secret = [0x5Au8; 32];
    let provision = ManifestBuilder::new(KeySlot::UPDATE_SECRET, 1, PayloadType::Data, secret.to_vec())
        .build(&signer)
        .expect("Failed to build secret update");
    assert_eq!(deliver(&fx, &provision).0.expect("Secret update failed"), (KeySlot::UPDATE_SECRET, 1));
    assert!(matches!(
        fx.device.update_version(KeySlot::UPDATE_SECRET),
        Err(SeError::ReservedSlot(_))
    ));

    let chain: Vec<u8> = (0..1100u32).map(|i| (i * 7) as u8).collect();
    let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Cert, chain.clone())
        .fragment_size(512)
        .encrypt_with(&secret)
        .build(&signer)
        .expect("Failed to build encrypted update");
    let delivered: Vec<u8> = package.fragments.iter().flat_map(|f| f.iter().copied()).collect();
    assert_eq!(delivered.len(), chain.len() + 16);
    assert_ne!(&delivered[..chain.len()], &chain[..]);
    assert_eq!(deliver(&fx, &package).0.expect("Encrypted update failed"), (KeySlot::CA_CHAIN, 1));
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), chain);

    // wrong secret: authentication fails before anything is written
    let wrong = ManifestBuilder::new(KeySlot::CA_CHAIN, 2, PayloadType::Cert, vec![1; 64])
        .encrypt_with(&[0xA5; 32])
        .build(&signer)
        .expect("Failed to build package");
    let writes = fx.probe.writes();
    assert!(matches!(deliver(&fx, &wrong).0, Err(SeError::SignatureInvalid(_))));
    assert_eq!(fx.probe.writes(), writes);
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), chain);
}

#[test]
fn test_update_secret_unreachable_from_public_path() {
    let fx = common::licensed();
    let writes = fx.probe.writes();
    assert!(matches!(
        fx.device.secure_store_write(KeySlot::UPDATE_SECRET, &[1; 16]),
        Err(SeError::ReservedSlot(KeySlot::UPDATE_SECRET))
    ));
    assert!(matches!(
        fx.device.secure_store_read(KeySlot::UPDATE_SECRET),
        Err(SeError::ReservedSlot(_))
    ));
    assert!(matches!(
        fx.device.hmac_sha256(KeySlot::UPDATE_SECRET, b"data"),
        Err(SeError::ReservedSlot(_))
    ));
    assert_eq!(fx.probe.writes(), writes);
}

#[test]
fn test_no_package_times_out() {
    let fx = common::licensed();
    let mut workflow = UpdateWorkflow::new(&fx.device, LoopbackTransport::new())
        .expect("Failed to create workflow")
        .with_sleeper(common::no_sleep());
    assert!(matches!(workflow.run(false), Err(SeError::Timeout(_))));
}

#[test]
fn test_version_beyond_tag_range_leaves_target_untouched() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let v2 = ManifestBuilder::new(KeySlot::CA_CHAIN, 2, PayloadType::Cert, vec![0x22; 32])
        .build(&signer)
        .expect("Failed to build v2");
    assert!(deliver(&fx, &v2).0.is_ok());

    let huge = ManifestBuilder::new(KeySlot::CA_CHAIN, 600_010, PayloadType::Cert, vec![0xAB; 4])
        .build(&signer)
        .expect("Failed to build package");
    let writes = fx.probe.writes();
    let (result, transport) = deliver(&fx, &huge);
    assert!(matches!(result, Err(SeError::InvalidParam(_))));
    assert_eq!(fx.probe.writes(), writes);
    assert_eq!(read(&fx, KeySlot::CA_CHAIN), vec![0x22; 32]);
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 2);
    assert_eq!(last_ack(&fx, &transport)["code"], -102);

    let top = ManifestBuilder::new(KeySlot::CA_CHAIN, MAX_OBJECT_VERSION as u32, PayloadType::Cert, vec![0x7F; 8])
        .build(&signer)
        .expect("Failed to build package");
    assert!(deliver(&fx, &top).0.is_ok());
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), MAX_OBJECT_VERSION as u32);
}

#[test]
fn test_targets_roll_forward_independently() {
    let fx = common::licensed();
    let signer = SigningKey::random(&mut OsRng);
    provision_anchor(&fx, &signer);

    let chain = ManifestBuilder::new(KeySlot::CA_CHAIN, 5, PayloadType::Cert, vec![0x55; 64])
        .build(&signer)
        .expect("Failed to build package");
    assert!(deliver(&fx, &chain).0.is_ok());

    let cert = ManifestBuilder::new(KeySlot::DEVICE_CERT, 1, PayloadType::Cert, vec![0x01; 64])
        .build(&signer)
        .expect("Failed to build package");
    assert_eq!(deliver(&fx, &cert).0.expect("Device cert update rejected"), (KeySlot::DEVICE_CERT, 1));
    assert_eq!(read(&fx, KeySlot::DEVICE_CERT), vec![0x01; 64]);
    assert_eq!(version(&fx, KeySlot::DEVICE_CERT), 1);
    assert_eq!(version(&fx, KeySlot::CA_CHAIN), 5);

    // each target still refuses its own rollback
    let stale = ManifestBuilder::new(KeySlot::CA_CHAIN, 4, PayloadType::Cert, vec![0x44; 64])
        .build(&signer)
        .expect("Failed to build package");
    assert!(matches!(
        deliver(&fx, &stale).0,
        Err(SeError::VersionStale { current: 5, offered: 4 })
    ));
    assert_eq!(version(&fx, KeySlot::DEVICE_CERT), 1);
}
