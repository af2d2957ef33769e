//! Device identity derived from the secure element UID

use crate::error::SeError;
use crate::platform::UID_LEN;
use std::fmt;

/// Immutable hardware identity of a device.
///
/// The identity is the 27-byte UID burned into the secure element. It is read
/// once when the device is opened and never changes afterwards. Its uppercase
/// hex form is used as the certificate subject, the transport client id and
/// the channel-name component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    uid: [u8; UID_LEN],
}

impl DeviceIdentity {
    /// Build an identity from raw UID bytes.
    pub fn from_uid(uid: &[u8]) -> Result<Self, SeError> {
        let uid: [u8; UID_LEN] = uid.try_into().map_err(|_| {
            SeError::InvalidParam(format!("UID must be {} bytes, got {}", UID_LEN, uid.len()))
        })?;
        Ok(Self { uid })
    }

    /// Parse the 54-character hex form (case-insensitive).
    pub fn from_hex(text: &str) -> Result<Self, SeError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| SeError::Parse(format!("UID is not valid hex: {}", e)))?;
        Self::from_uid(&bytes)
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// Uppercase hex rendering of the UID.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.uid)
    }

    /// Common name placed in CSRs and expected in issued certificates.
    pub fn common_name(&self) -> String {
        self.to_hex()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
