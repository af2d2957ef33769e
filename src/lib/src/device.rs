//! The device handle
//!
//! [`SecureDevice`] bundles the secure element facade, the license gate and the
//! clock. It is the only public way to reach the hardware: every operation
//! goes through [`SecureDevice::session`], which refuses to hand out a bus
//! guard while the license gate is closed.

use crate::config::DeviceConfig;
use crate::error::SeError;
use crate::facade::{FacadeGuard, SecureElementFacade};
use crate::identity::DeviceIdentity;
use crate::license::{LicenseGate, LicenseStatus};
use crate::platform::{SecureElement, SecurityLevel};
use crate::time::{SystemTimeSource, TimeSource};
use std::sync::{Arc, OnceLock};

pub struct SecureDevice {
    facade: SecureElementFacade,
    license: LicenseGate,
    identity: OnceLock<DeviceIdentity>,
    time: Arc<dyn TimeSource>,
    config: DeviceConfig,
}

impl SecureDevice {
    /// Open a device over `element`.
    ///
    /// The license is not checked until [`SecureDevice::init`] runs.
    pub fn new(element: Box<dyn SecureElement>, config: DeviceConfig) -> Result<Self, SeError> {
        config.validate()?;
        let facade = SecureElementFacade::new(element, config.slot_map())?;
        let license = LicenseGate::new(&config.license)?;
        Ok(Self {
            facade,
            license,
            identity: OnceLock::new(),
            time: Arc::new(SystemTimeSource),
            config,
        })
    }

    /// Replace the wall clock.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Read the UID and verify the license.
    pub fn init(&self) -> LicenseStatus {
        let uid = self.facade.acquire().and_then(|mut se| se.read_uid());
        if let Ok(bytes) = &uid {
            if self.identity.get().is_none() {
                if let Ok(identity) = DeviceIdentity::from_uid(bytes) {
                    let _ = self.identity.set(identity);
                }
            }
        }
        self.license.init_with_uid(uid)
    }

    /// Re-verify after the element was power-cycled or reset.
    pub fn reinit(&self) -> LicenseStatus {
        log::info!("Reinitializing secure element session");
        self.init()
    }

    pub fn license_status(&self) -> LicenseStatus {
        self.license.status()
    }

    pub fn is_licensed(&self) -> bool {
        self.license.is_licensed()
    }

    /// Hardware identity, available once `init` has read the UID.
    pub fn identity(&self) -> Result<&DeviceIdentity, SeError> {
        self.identity.get().ok_or(SeError::NotInitialized)
    }

    /// Exclusive, license-checked access to the element.
    ///
    /// Fails with [`SeError::NotLicensed`] before touching the bus.
    pub fn session(&self) -> Result<FacadeGuard<'_>, SeError> {
        self.license.ensure_licensed()?;
        self.facade.acquire()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.time.as_ref()
    }

    pub fn firmware_version(&self) -> &str {
        &self.config.device.firmware_version
    }

    pub fn element_name(&self) -> &str {
        self.facade.name()
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.facade.security_level()
    }
}
