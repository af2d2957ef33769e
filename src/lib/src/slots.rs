//! Slot map: logical key slots to physical secure-element objects
//!
//! The slot map is a fixed table shared by the device and the issuing
//! platform. Every storage access goes through [`SlotMap::resolve`], which is
//! the single place where the reserved protected-update slot, locked objects and
//! read-only factory objects are enforced.
//!
//! Two profiles are provided. [`SlotProfile::Embedded`] keeps the device
//! certificate in `0xE0E1`. [`SlotProfile::Linux`] targets modules where
//! `0xE0E1` was locked during manufacturing, so the device certificate moves to
//! `0xE0E2` and `0xE0E1` is marked [`SlotAccess::Locked`].

use crate::error::SeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical slot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySlot(pub u8);

impl KeySlot {
    /// Protected-update shared secret. Rejected by every public API.
    pub const UPDATE_SECRET: KeySlot = KeySlot(4);
    /// Last general-purpose data store slot.
    pub const DATA_STORE_LAST: KeySlot = KeySlot(13);

    pub const FACTORY_KEY: KeySlot = KeySlot(0x20);
    pub const IDENTITY_KEY: KeySlot = KeySlot(0x21);
    pub const APP_KEY: KeySlot = KeySlot(0x22);
    pub const SPARE_KEY: KeySlot = KeySlot(0x23);
    pub const AES_KEY: KeySlot = KeySlot(0x24);

    pub const FACTORY_CERT: KeySlot = KeySlot(0x30);
    pub const DEVICE_CERT: KeySlot = KeySlot(0x31);
    pub const SPARE_CERT: KeySlot = KeySlot(0x32);
    pub const TRUST_ANCHOR: KeySlot = KeySlot(0x33);
    pub const CA_CHAIN: KeySlot = KeySlot(0x34);
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical object identifier inside the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u16);

impl ObjectId {
    /// Lifecycle state object (LcsO).
    pub const LIFECYCLE: ObjectId = ObjectId(0xE0C0);
    /// 27-byte hardware unique identifier.
    pub const UID: ObjectId = ObjectId(0xE0C2);
    /// First monotonic counter object.
    pub const COUNTER_BASE: ObjectId = ObjectId(0xE120);
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Monotonic counter identifier (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CounterId(u8);

impl CounterId {
    pub const COUNT: u8 = 4;

    /// Outbound message sequence numbers
    pub const MESSAGE_SEQUENCE: CounterId = CounterId(0);
    /// Firmware update version
    pub const FIRMWARE_VERSION: CounterId = CounterId(1);
    /// Key usage tally
    pub const USAGE: CounterId = CounterId(2);
    /// Security event tally
    pub const SECURITY_EVENTS: CounterId = CounterId(3);

    pub fn new(id: u8) -> Result<Self, SeError> {
        if id >= Self::COUNT {
            return Err(SeError::InvalidParam(format!(
                "counter id {} out of range 0..={}",
                id,
                Self::COUNT - 1
            )));
        }
        Ok(CounterId(id))
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    pub fn object(&self) -> ObjectId {
        ObjectId(ObjectId::COUNTER_BASE.0 + self.0 as u16)
    }
}

impl TryFrom<u8> for CounterId {
    type Error = SeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        CounterId::new(value)
    }
}

impl From<CounterId> for u8 {
    fn from(id: CounterId) -> u8 {
        id.0
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    /// General-purpose secure storage
    DataStore,
    /// Ephemeral key usable for ECDH
    SessionKey,
    /// Long-lived key bound to the device certificate
    IdentityKey,
    /// Factory-provisioned key bound to the factory certificate
    FactoryKey,
    AesKey,
    FactoryCertificate,
    DeviceCertificate,
    TrustAnchor,
    CaChain,
    /// Shared secret for confidential protected updates
    UpdateSecret,
}

impl SlotRole {
    /// Key slots hold key material, never readable bytes.
    pub fn is_key(&self) -> bool {
        matches!(
            self,
            SlotRole::SessionKey | SlotRole::IdentityKey | SlotRole::FactoryKey | SlotRole::AesKey
        )
    }

    pub fn is_certificate(&self) -> bool {
        matches!(
            self,
            SlotRole::FactoryCertificate
                | SlotRole::DeviceCertificate
                | SlotRole::TrustAnchor
                | SlotRole::CaChain
        )
    }

    /// Slots that may act as HMAC/HKDF secrets.
    pub fn is_secret_source(&self) -> bool {
        matches!(self, SlotRole::DataStore | SlotRole::UpdateSecret)
    }
}

/// Who may touch a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAccess {
    ReadWrite,
    /// Factory provisioned, never written in the field
    ReadOnly,
    /// Locked in hardware; writes fail with [`SeError::SlotLocked`]
    Locked,
    /// Only reachable through the protected-update internal path
    ProtectedUpdate,
}

/// Caller path presented to [`SlotMap::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    Public,
    ProtectedUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOp {
    Read,
    Write,
    /// Use key material in place (sign, ECDH, HMAC)
    Use,
}

/// One row of the slot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub slot: KeySlot,
    pub object: ObjectId,
    /// Byte capacity for data objects; zero for key objects
    pub capacity: usize,
    pub role: SlotRole,
    pub access: SlotAccess,
    /// Protected updates may target this slot; its object then carries a
    /// version tag checked against every manifest
    #[serde(default)]
    pub updatable: bool,
}

impl SlotEntry {
    fn new(slot: KeySlot, object: u16, capacity: usize, role: SlotRole, access: SlotAccess) -> Self {
        Self {
            slot,
            object: ObjectId(object),
            capacity,
            role,
            access,
            updatable: false,
        }
    }

    fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    /// Reject `len` bytes that do not fit.
    pub fn check_capacity(&self, len: usize) -> Result<(), SeError> {
        if len > self.capacity {
            return Err(SeError::SizeExceeded {
                slot: self.slot,
                capacity: self.capacity,
                len,
            });
        }
        Ok(())
    }
}

/// Per-platform slot assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotProfile {
    Embedded,
    #[default]
    Linux,
}

/// Capacity of the small data-store objects.
pub const SMALL_SLOT_CAPACITY: usize = 140;
/// Capacity of the large data-store objects.
pub const LARGE_SLOT_CAPACITY: usize = 1500;
const CERT_CAPACITY: usize = 1728;
const ANCHOR_CAPACITY: usize = 1200;

/// Table mapping logical slots to objects, capacities and access rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMap {
    entries: Vec<SlotEntry>,
}

impl SlotMap {
    /// Build the default table for a profile.
    pub fn for_profile(profile: SlotProfile) -> Self {
        use SlotAccess::*;
        use SlotRole::*;

        let mut entries = Vec::new();

        for i in 0u8..=11 {
            let object = 0xF1D0 + i as u16;
            if KeySlot(i) == KeySlot::UPDATE_SECRET {
                entries.push(
                    SlotEntry::new(KeySlot(i), object, SMALL_SLOT_CAPACITY, UpdateSecret, ProtectedUpdate)
                        .updatable(),
                );
            } else {
                entries.push(SlotEntry::new(KeySlot(i), object, SMALL_SLOT_CAPACITY, DataStore, ReadWrite));
            }
        }
        entries.push(SlotEntry::new(KeySlot(12), 0xF1E0, LARGE_SLOT_CAPACITY, DataStore, ReadWrite));
        entries.push(SlotEntry::new(KeySlot(13), 0xF1E1, LARGE_SLOT_CAPACITY, DataStore, ReadWrite));

        entries.push(SlotEntry::new(KeySlot::FACTORY_KEY, 0xE0F0, 0, FactoryKey, ReadOnly));
        entries.push(SlotEntry::new(KeySlot::IDENTITY_KEY, 0xE0F1, 0, IdentityKey, ReadWrite));
        entries.push(
            SlotEntry::new(KeySlot::APP_KEY, 0xE0F2, 0, SessionKey, ReadWrite)
                .updatable(),
        );
        entries.push(
            SlotEntry::new(KeySlot::SPARE_KEY, 0xE0F3, 0, SessionKey, ReadWrite)
                .updatable(),
        );
        entries.push(
            SlotEntry::new(KeySlot::AES_KEY, 0xE200, 0, AesKey, ReadWrite)
                .updatable(),
        );

        entries.push(SlotEntry::new(KeySlot::FACTORY_CERT, 0xE0E0, CERT_CAPACITY, FactoryCertificate, ReadOnly));
        match profile {
            SlotProfile::Embedded => {
                entries.push(
                    SlotEntry::new(KeySlot::DEVICE_CERT, 0xE0E1, CERT_CAPACITY, DeviceCertificate, ReadWrite)
                        .updatable(),
                );
                entries.push(
                    SlotEntry::new(KeySlot::SPARE_CERT, 0xE0E2, CERT_CAPACITY, DeviceCertificate, ReadWrite)
                        .updatable(),
                );
            }
            SlotProfile::Linux => {
                entries.push(
                    SlotEntry::new(KeySlot::DEVICE_CERT, 0xE0E2, CERT_CAPACITY, DeviceCertificate, ReadWrite)
                        .updatable(),
                );
                entries.push(SlotEntry::new(KeySlot::SPARE_CERT, 0xE0E1, CERT_CAPACITY, DeviceCertificate, Locked));
            }
        }
        entries.push(
            SlotEntry::new(KeySlot::TRUST_ANCHOR, 0xE0E8, ANCHOR_CAPACITY, TrustAnchor, ReadWrite)
                .updatable(),
        );
        entries.push(
            SlotEntry::new(KeySlot::CA_CHAIN, 0xE0E9, ANCHOR_CAPACITY, CaChain, ReadWrite)
                .updatable(),
        );

        SlotMap { entries }
    }

    /// Build a table from explicit entries, validating it.
    pub fn from_entries(entries: Vec<SlotEntry>) -> Result<Self, SeError> {
        let map = SlotMap { entries };
        map.validate()?;
        Ok(map)
    }

    /// Check table consistency.
    ///
    /// Slots and objects are unique, exactly one slot is reserved for protected
    /// updates, key slots carry no byte capacity and data slots do.
    pub fn validate(&self) -> Result<(), SeError> {
        let mut slots = std::collections::BTreeSet::new();
        let mut objects = std::collections::BTreeSet::new();
        let mut reserved = 0;

        for entry in &self.entries {
            if !slots.insert(entry.slot) {
                return Err(SeError::InvalidParam(format!("duplicate slot {}", entry.slot)));
            }
            if !objects.insert(entry.object) {
                return Err(SeError::InvalidParam(format!(
                    "object {} mapped twice",
                    entry.object
                )));
            }
            if entry.role.is_key() != (entry.capacity == 0) {
                return Err(SeError::InvalidParam(format!(
                    "slot {} capacity {} does not match role {:?}",
                    entry.slot, entry.capacity, entry.role
                )));
            }
            if entry.access == SlotAccess::ProtectedUpdate {
                if entry.role != SlotRole::UpdateSecret {
                    return Err(SeError::InvalidParam(format!(
                        "slot {} is reserved but not an update secret",
                        entry.slot
                    )));
                }
                reserved += 1;
            }
            if entry.updatable
                && matches!(entry.access, SlotAccess::ReadOnly | SlotAccess::Locked)
            {
                return Err(SeError::InvalidParam(format!(
                    "slot {} is not writable and cannot be an update target",
                    entry.slot
                )));
            }
        }

        if reserved != 1 {
            return Err(SeError::InvalidParam(format!(
                "expected exactly one reserved slot, found {}",
                reserved
            )));
        }
        Ok(())
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    pub fn entry(&self, slot: KeySlot) -> Option<&SlotEntry> {
        self.entries.iter().find(|e| e.slot == slot)
    }

    /// First slot carrying `role`.
    pub fn slot_for_role(&self, role: SlotRole) -> Option<KeySlot> {
        self.entries.iter().find(|e| e.role == role).map(|e| e.slot)
    }

    /// The slot reserved for protected-update shared secrets.
    pub fn reserved_slot(&self) -> Option<KeySlot> {
        self.entries
            .iter()
            .find(|e| e.access == SlotAccess::ProtectedUpdate)
            .map(|e| e.slot)
    }

    /// Look up `slot` and check that `path` may perform `op` on it.
    pub fn resolve(&self, slot: KeySlot, op: SlotOp, path: AccessPath) -> Result<&SlotEntry, SeError> {
        let entry = self
            .entry(slot)
            .ok_or_else(|| SeError::InvalidParam(format!("unknown slot {}", slot)))?;

        match (entry.access, path) {
            (SlotAccess::ProtectedUpdate, AccessPath::Public) => {
                return Err(SeError::ReservedSlot(slot));
            }
            (SlotAccess::Locked, _) if op == SlotOp::Write => {
                return Err(SeError::SlotLocked(entry.object));
            }
            (SlotAccess::ReadOnly, _) if op == SlotOp::Write => {
                return Err(SeError::InvalidParam(format!("slot {} is read-only", slot)));
            }
            _ => {}
        }

        Ok(entry)
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        SlotMap::for_profile(SlotProfile::default())
    }
}
