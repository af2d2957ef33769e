//! Time sources for devices without a trusted clock
//!
//! Embedded targets often boot with an unset RTC. Certificate lifetime checks
//! and attestation timestamps therefore take a pluggable [`TimeSource`]:
//!
//! - [`SystemTimeSource`]: the host clock (default on Linux targets)
//! - [`BuildTimeSource`]: no current time, only the build timestamp as a floor
//! - [`FixedTimeSource`]: a pinned instant for tests and replays
//!
//! A clock is considered *synced* when it claims to be reliable and reports a
//! time no earlier than the build timestamp.

use crate::error::SeError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix timestamp of the library build, set by `build.rs`.
///
/// Nothing running this binary can legitimately observe an earlier time.
pub const BUILD_TIMESTAMP: u64 = {
    match option_env!("SEID_BUILD_TIMESTAMP") {
        Some(s) => {
            let bytes = s.as_bytes();
            let mut result: u64 = 0;
            let mut i = 0;
            while i < bytes.len() {
                let digit = bytes[i] as u64 - b'0' as u64;
                result = result * 10 + digit;
                i += 1;
            }
            result
        }
        // 2025-01-01 00:00:00 UTC
        None => 1735689600,
    }
};

/// Pluggable wall clock.
pub trait TimeSource: Send + Sync {
    /// Current time. Fails when the source cannot tell.
    fn now(&self) -> Result<SystemTime, SeError>;

    /// Lower bound for any valid time, normally the build time.
    fn minimum_time(&self) -> SystemTime;

    /// Whether `now()` may be used for validity decisions.
    fn is_reliable(&self) -> bool;

    fn now_unix(&self) -> Result<u64, SeError> {
        let time = self.now()?;
        Ok(time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs())
    }

    fn minimum_unix(&self) -> u64 {
        self.minimum_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<SystemTime, SeError> {
        Ok(SystemTime::now())
    }

    fn minimum_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(BUILD_TIMESTAMP)
    }

    fn is_reliable(&self) -> bool {
        true
    }
}

/// Source for devices with no clock at all.
///
/// Only the build-time floor is known; `now()` always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildTimeSource;

impl TimeSource for BuildTimeSource {
    fn now(&self) -> Result<SystemTime, SeError> {
        Err(SeError::TimeError(
            "BuildTimeSource does not provide current time".to_string(),
        ))
    }

    fn minimum_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(BUILD_TIMESTAMP)
    }

    fn is_reliable(&self) -> bool {
        false
    }
}

/// Pinned instant, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    timestamp: SystemTime,
}

impl FixedTimeSource {
    /// # Errors
    ///
    /// Returns an error if the timestamp is before the build time.
    pub fn from_unix_secs(secs: u64) -> Result<Self, SeError> {
        if secs < BUILD_TIMESTAMP {
            return Err(SeError::TimeError(format!(
                "Timestamp {} is before build time {}",
                secs, BUILD_TIMESTAMP
            )));
        }
        Ok(Self {
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
        })
    }

    pub fn from_system_time(time: SystemTime) -> Result<Self, SeError> {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SeError::TimeError(format!("Time before Unix epoch: {}", e)))?
            .as_secs();
        Self::from_unix_secs(secs)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Result<SystemTime, SeError> {
        Ok(self.timestamp)
    }

    fn minimum_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(BUILD_TIMESTAMP)
    }

    fn is_reliable(&self) -> bool {
        true
    }
}

/// Whether `source` can be trusted for validity checks right now.
pub fn is_synced(source: &dyn TimeSource) -> bool {
    if !source.is_reliable() {
        return false;
    }
    match source.now_unix() {
        Ok(now) => now >= source.minimum_unix(),
        Err(_) => false,
    }
}

/// Whole days from `now` until `not_after`, negative once expired.
pub fn days_until(now_unix: u64, not_after_unix: i64) -> i64 {
    let delta = not_after_unix - now_unix as i64;
    delta.div_euclid(86_400)
}
