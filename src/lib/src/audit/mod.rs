//! Audit logging for security-relevant device events.
//!
//! Events are emitted through `tracing` under the `seid::audit` target, so they
//! can be routed separately from the ordinary `log` output of the library.
//!
//! # Usage
//!
//! ```rust,ignore
//! use seid::audit::{self, AuditConfig, LogDestination};
//!
//! audit::init(AuditConfig {
//!     destination: LogDestination::Stdout,
//!     ..AuditConfig::default()
//! })?;
//! ```
//!
//! # Event Types
//!
//! - `license.verified` - License gate opened
//! - `license.rejected` - License verification failed
//! - `key.generated` - Key pair generated inside the element
//! - `certificate.installed` - Device certificate or trust anchor written
//! - `update.applied` - Protected update committed
//! - `update.rejected` - Protected update refused
//! - `update.version_recorded` - Anti-rollback version written to the target
//! - `counter.advanced` - Monotonic counter incremented
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-03-02T08:00:00Z",
//!   "level": "INFO",
//!   "target": "seid::audit",
//!   "event_type": "update.applied",
//!   "correlation_id": "0b6f...",
//!   "target_slot": 51,
//!   "version": 5
//! }
//! ```

use crate::error::SeError;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

static AUDIT_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub destination: LogDestination,
    /// Use JSON format (default: true)
    pub json_format: bool,
    /// Shorten device identities in events (default: true)
    pub redact_identity: bool,
    /// Filter directive (default: "seid::audit=info")
    pub filter: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: LogDestination::Stderr,
            json_format: true,
            redact_identity: true,
            filter: "seid::audit=info".to_string(),
        }
    }
}

/// Audit log destination
#[derive(Debug, Clone, Default)]
pub enum LogDestination {
    Stdout,
    #[default]
    Stderr,
    /// Append to a file
    File(String),
}

static REDACT_IDENTITY: OnceLock<bool> = OnceLock::new();

/// Initialize the audit subsystem.
///
/// Only the first call has any effect.
pub fn init(config: AuditConfig) -> Result<(), SeError> {
    if AUDIT_INITIALIZED.get().is_some() {
        return Ok(());
    }
    let _ = REDACT_IDENTITY.set(config.redact_identity);

    if !config.enabled {
        let _ = AUDIT_INITIALIZED.set(true);
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.destination {
        LogDestination::Stdout => install(filter, config.json_format, std::io::stdout),
        LogDestination::Stderr => install(filter, config.json_format, std::io::stderr),
        LogDestination::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            install(filter, config.json_format, std::sync::Mutex::new(file))
        }
    }

    let _ = AUDIT_INITIALIZED.set(true);
    Ok(())
}

fn install<W>(filter: EnvFilter, json: bool, writer: W)
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::NONE)
                    .with_writer(writer),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(writer))
            .try_init()
    };
    if let Err(e) = result {
        log::warn!("Audit subscriber not installed: {}", e);
    }
}

/// Shorten a device identity to its first and last four characters.
///
/// `"0A0B...54 hex chars...EEFF"` becomes `"0A0B***EEFF"`.
pub fn redact_identity(identity: &str) -> String {
    if identity.len() <= 8 || !identity.is_ascii() {
        return identity.to_string();
    }
    format!("{}***{}", &identity[..4], &identity[identity.len() - 4..])
}

fn display_identity(identity: &str) -> String {
    if *REDACT_IDENTITY.get().unwrap_or(&true) {
        redact_identity(identity)
    } else {
        identity.to_string()
    }
}

/// Generate a new correlation ID for tracking related audit events.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Audit Event Functions
// ============================================================================

pub fn log_license_verified(identity: &str) {
    tracing::info!(
        target: "seid::audit",
        event_type = "license.verified",
        identity = %display_identity(identity),
        "License verified"
    );
}

pub fn log_license_rejected(identity: &str, status: &str) {
    tracing::warn!(
        target: "seid::audit",
        event_type = "license.rejected",
        identity = %display_identity(identity),
        status = status,
        "License rejected"
    );
}

/// Log a key generation event.
pub fn log_key_generation(slot: u8, key_type: &str) {
    tracing::info!(
        target: "seid::audit",
        event_type = "key.generated",
        slot = slot,
        key_type = key_type,
        "Key pair generated in secure element"
    );
}

pub fn log_certificate_installed(slot: u8, subject: &str, fingerprint: &str) {
    tracing::info!(
        target: "seid::audit",
        event_type = "certificate.installed",
        slot = slot,
        subject = %display_identity(subject),
        fingerprint = fingerprint,
        "Certificate installed"
    );
}

pub fn log_update_applied(correlation_id: &str, target_slot: u8, version: u32, fragments: usize) {
    tracing::info!(
        target: "seid::audit",
        event_type = "update.applied",
        correlation_id = correlation_id,
        target_slot = target_slot,
        version = version,
        fragments = fragments,
        "Protected update applied"
    );
}

pub fn log_update_rejected(correlation_id: &str, error_type: &str, error_message: &str) {
    let safe_message = sanitize_error_message(error_message);
    tracing::warn!(
        target: "seid::audit",
        event_type = "update.rejected",
        correlation_id = correlation_id,
        error_type = error_type,
        error_message = %safe_message,
        "Protected update rejected"
    );
}

pub fn log_version_recorded(slot: u8, version: u32) {
    tracing::info!(
        target: "seid::audit",
        event_type = "update.version_recorded",
        slot = slot,
        version = version,
        "Anti-rollback version recorded"
    );
}

pub fn log_counter_advanced(counter: u8, value: u32, step: u8) {
    tracing::info!(
        target: "seid::audit",
        event_type = "counter.advanced",
        counter = counter,
        value = value,
        step = step,
        "Monotonic counter advanced"
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Strip token-like words and cap the length of an error message.
fn sanitize_error_message(message: &str) -> String {
    let sanitized = message
        .split_whitespace()
        .map(|word| {
            if word.len() > 40 && word.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                "[REDACTED]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if sanitized.len() > 500 {
        let mut end = 497;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sanitized[..end])
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_identity() {
        let uid = "0A0B".to_string() + &"11".repeat(23) + "EEFF";
        assert_eq!(redact_identity(&uid), "0A0B***EEFF");
        assert_eq!(redact_identity("short"), "short");
    }

    #[test]
    fn test_sanitize_error_message() {
        assert_eq!(
            sanitize_error_message("Manifest signature invalid"),
            "Manifest signature invalid"
        );
        let with_secret = "Bad secret c2VjcmV0c2VjcmV0c2VjcmV0c2VjcmV0c2VjcmV0c2VjcmV0";
        assert!(sanitize_error_message(with_secret).contains("[REDACTED]"));
        assert!(sanitize_error_message(&"x ".repeat(400)).len() <= 500);
    }

    #[test]
    fn test_correlation_id_format() {
        let id = new_correlation_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|c| *c == '-').count(), 4);
    }
}
