//! Health diagnostics
//!
//! [`SecureDevice::health_check`] takes a read-only snapshot of the device:
//! element reachability, stored certificates, license, transport and clock.
//! It holds the bus guard for the whole snapshot, so it never observes a
//! half-applied protected update.

use crate::device::SecureDevice;
use crate::error::SeError;
use crate::facade::FacadeGuard;
use crate::platform::{LifecycleState, SecurityLevel};
use crate::slots::KeySlot;
use crate::time;
use crate::transport::Transport;
use serde::Serialize;

/// Snapshot of device health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub secure_element_ok: bool,
    pub factory_cert_ok: bool,
    pub device_cert_ok: bool,
    pub license_ok: bool,
    pub transport_ok: bool,
    pub time_synced: bool,
    /// Days until the device certificate expires, when known
    pub cert_days_remaining: Option<i64>,
    pub lifecycle_state: Option<LifecycleState>,
    pub firmware_version: String,
    pub hardware_certified: bool,
}

impl HealthReport {
    /// All mandatory checks passed.
    pub fn is_healthy(&self) -> bool {
        self.secure_element_ok && self.license_ok && self.device_cert_ok
    }
}

/// Parsed certificate facts needed by the report.
struct CertStatus {
    not_after: i64,
    not_before: i64,
}

fn read_certificate(se: &mut FacadeGuard<'_>, slot: KeySlot) -> Option<CertStatus> {
    let der = se.read_vec(slot).ok()?;
    if der.is_empty() {
        return None;
    }
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    let validity = cert.validity();
    Some(CertStatus {
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
    })
}

impl SecureDevice {
    /// Collect a [`HealthReport`]. Performs no writes.
    pub fn health_check(&self, transport: Option<&dyn Transport>) -> Result<HealthReport, SeError> {
        let mut se = self.session()?;

        let secure_element_ok = se.read_uid().is_ok();
        let lifecycle_state = se.read_lifecycle().ok();
        let factory = read_certificate(&mut se, KeySlot::FACTORY_CERT);
        let device = read_certificate(&mut se, KeySlot::DEVICE_CERT);
        drop(se);

        let time_synced = time::is_synced(self.time_source());
        let now = if time_synced {
            self.time_source().now_unix().ok()
        } else {
            None
        };

        let within = |cert: &CertStatus| match now {
            Some(now) => cert.not_before <= now as i64 && now as i64 <= cert.not_after,
            None => true,
        };

        let report = HealthReport {
            secure_element_ok,
            factory_cert_ok: factory.as_ref().map(&within).unwrap_or(false),
            device_cert_ok: device.as_ref().map(&within).unwrap_or(false),
            license_ok: self.is_licensed(),
            transport_ok: transport.map(|t| t.is_connected()).unwrap_or(false),
            time_synced,
            cert_days_remaining: match (&device, now) {
                (Some(cert), Some(now)) => Some(time::days_until(now, cert.not_after)),
                _ => None,
            },
            lifecycle_state,
            firmware_version: self.firmware_version().to_string(),
            hardware_certified: self.security_level() == SecurityLevel::HardwareCertified,
        };
        log::debug!("health check: {:?}", report);
        Ok(report)
    }
}
