//! Identity lifecycle for devices that own a hardware secure element.
//!
//! A [`device::SecureDevice`] wraps the secure element behind a license gate.
//! On top of it the crate provides a gated crypto layer, a CSR workflow that
//! provisions the device certificate, and a protected update workflow that
//! rewrites secure-element objects from manifests signed by the trust anchor.

#![allow(clippy::vec_init_then_push)]
#![forbid(unsafe_code)]

mod error;
mod identity;

/// Security audit events
///
/// Structured `tracing` events for license decisions, key generation,
/// certificate installation, protected updates and counter changes.
pub mod audit;

/// Attestation tokens and JWT signing
pub mod attestation;

/// TOML device configuration
pub mod config;

/// Monotonic counters
pub mod counter;

/// Gated crypto utilities: random, AES-CBC, HMAC, ECDH, HKDF, signing and
/// the secure store
pub mod crypto;

/// Certificate signing request workflow
///
/// Generates the identity key, submits a CSR over the transport and
/// installs the validated device certificate.
pub mod csr;

/// The license-gated device handle
pub mod device;

/// Slot policy and the exclusive bus guard
pub mod facade;

/// Read-only diagnostics
pub mod health;

/// License verification
///
/// Binds the hardware UID to an issuer-signed credential. Every other
/// operation is refused until the gate opens.
pub mod license;

/// Secure element capability
///
/// The raw object interface of a secure element plus a software
/// implementation used by tests and the emulator.
pub mod platform;

/// Protected update workflow
///
/// Verifies signed manifests against the trust anchor and applies them with
/// rollback protection.
pub mod protected_update;

/// Logical slot table
pub mod slots;

/// Time validation for devices without a trusted clock
///
/// Provides a time source abstraction with a build-time lower bound, used to
/// decide whether certificate validity can be checked.
pub mod time;

/// Backend message transport
pub mod transport;

/// Pieces shared by the workflow state machines
pub mod workflow;

pub use error::*;
pub use identity::*;

pub mod reexports {
    pub use {hmac_sha256, log, p256, thiserror};
}
