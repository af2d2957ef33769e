//! Fuzz target for the bootstrap JSON bundle
//!
//! The bundle carries the trust anchor certificate, so it is parsed before the
//! device trusts anything.
//!
//! Security concerns:
//! - Oversized documents and base64 fields
//! - Inconsistent `fragment_count`
//! - Certificates that are neither X.509 nor SPKI

#![no_main]

use libfuzzer_sys::fuzz_target;
use seid::protected_update::{trust_anchor_key, JsonBundle};

fuzz_target!(|data: &[u8]| {
    if let Ok(bundle) = JsonBundle::parse(data) {
        let _ = trust_anchor_key(&bundle.signing_certificate);
        if let Ok(json) = bundle.to_json() {
            assert_eq!(JsonBundle::parse(json.as_bytes()).ok(), Some(bundle));
        }
    }
});
