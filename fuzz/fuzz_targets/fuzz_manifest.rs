//! Fuzz target for protected update manifests and packages
//!
//! Covers the two decoders an attacker reaches before any signature check:
//! - CBOR update packages (`{manifest, fragments}`)
//! - Signed manifests (outer envelope, inner body, raw signature)
//!
//! Security concerns:
//! - Memory exhaustion via declared lengths
//! - Fragment count and length limits
//! - Malformed signatures and encryption parameters

#![no_main]

use libfuzzer_sys::fuzz_target;
use seid::protected_update::{Manifest, UpdatePackage, MAX_FRAGMENTS, MAX_FRAGMENT_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok(manifest) = Manifest::parse(data) {
        let payload = &manifest.payload;
        assert!(payload.fragments as usize <= MAX_FRAGMENTS);
        assert!(payload.length as usize <= payload.fragments as usize * MAX_FRAGMENT_LEN);
        let _ = manifest.digest();
        let _ = manifest.signature();
    }

    if let Ok(package) = UpdatePackage::from_cbor(data) {
        assert!(package.check_limits().is_ok());
        let _ = Manifest::parse(&package.manifest);
    }
});
