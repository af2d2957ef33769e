//! Device configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! [license]
//! uid = "0A0B...54 hex characters..."
//! key = "MEUCIQ...base64 DER signature..."
//!
//! [device]
//! firmware_version = "1.4.0"
//! profile = "linux"
//!
//! [csr]
//! max_attempts = 150
//! backoff_ms = 2000
//!
//! [protected_update]
//! manifest_timeout_ms = 30000
//! ```
//!
//! Every section is optional. An explicit `[slots]` table replaces the slot
//! map of the selected profile.

use crate::error::SeError;
use crate::slots::{SlotMap, SlotProfile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// License credential as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LicenseConfig {
    /// Expected UID, 54 hex characters
    pub uid: Option<String>,
    /// Base64 of the DER issuer signature over the UID
    pub key: Option<String>,
    /// Override of the embedded issuer key (hex, uncompressed SEC1)
    pub issuer_public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    /// Reported in health and attestation
    pub firmware_version: String,
    pub profile: SlotProfile,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            profile: SlotProfile::default(),
        }
    }
}

/// CSR workflow tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsrConfig {
    /// Connect/publish attempts before giving up
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff_ms: u64,
    /// How long one certificate wait lasts
    pub certificate_timeout_ms: u64,
    /// Number of certificate waits before timing out
    pub wait_attempts: u32,
    /// Attempts per hardware step before a fault becomes fatal
    pub hardware_retries: u32,
    /// Optional subject organization (O=)
    pub organization: Option<String>,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            max_attempts: 150,
            backoff_ms: 2000,
            certificate_timeout_ms: 60_000,
            wait_attempts: 1,
            hardware_retries: 3,
            organization: None,
        }
    }
}

impl CsrConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn certificate_timeout(&self) -> Duration {
        Duration::from_millis(self.certificate_timeout_ms)
    }
}

/// Protected update workflow tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtectedUpdateConfig {
    pub manifest_timeout_ms: u64,
    /// Number of manifest waits before timing out
    pub wait_attempts: u32,
}

impl Default for ProtectedUpdateConfig {
    fn default() -> Self {
        Self {
            manifest_timeout_ms: 30_000,
            wait_attempts: 1,
        }
    }
}

impl ProtectedUpdateConfig {
    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.manifest_timeout_ms)
    }
}

/// Top-level device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub license: LicenseConfig,
    pub device: DeviceSection,
    pub csr: CsrConfig,
    pub protected_update: ProtectedUpdateConfig,
    /// Full slot table, replacing the profile's
    pub slots: Option<SlotMap>,
}

impl DeviceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, SeError> {
        let config: DeviceConfig = toml::from_str(text)
            .map_err(|e| SeError::Parse(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SeError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, SeError> {
        toml::to_string(self)
            .map_err(|e| SeError::Internal(format!("Failed to serialize configuration: {}", e)))
    }

    /// The slot map in effect: the override if present, else the profile's.
    pub fn slot_map(&self) -> SlotMap {
        self.slots
            .clone()
            .unwrap_or_else(|| SlotMap::for_profile(self.device.profile))
    }

    pub fn validate(&self) -> Result<(), SeError> {
        if self.csr.max_attempts == 0 {
            return Err(SeError::InvalidParam("csr.max_attempts must be at least 1".to_string()));
        }
        if self.csr.hardware_retries == 0 {
            return Err(SeError::InvalidParam(
                "csr.hardware_retries must be at least 1".to_string(),
            ));
        }
        if self.csr.wait_attempts == 0 || self.protected_update.wait_attempts == 0 {
            return Err(SeError::InvalidParam("wait_attempts must be at least 1".to_string()));
        }
        if self.device.firmware_version.is_empty() {
            return Err(SeError::InvalidParam(
                "device.firmware_version must not be empty".to_string(),
            ));
        }
        if let Some(slots) = &self.slots {
            slots.validate()?;
        }
        Ok(())
    }
}
