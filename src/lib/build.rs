//! Build script for the seid library
//!
//! Sets SEID_BUILD_TIMESTAMP, the lower bound used by time.rs.

use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before Unix epoch")
        .as_secs();

    println!("cargo::rerun-if-changed=build.rs");
    println!("cargo::rustc-env=SEID_BUILD_TIMESTAMP={}", timestamp);
}
