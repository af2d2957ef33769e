//! Secure element facade
//!
//! [`SecureElementFacade`] owns the [`SecureElement`] capability and the
//! [`SlotMap`]. The element is a single-master serial device, so every access
//! goes through [`SecureElementFacade::acquire`], which hands out an exclusive
//! [`FacadeGuard`]. The guard is where slot policy is applied: reserved slots,
//! locked objects and capacity limits are all checked before any bus traffic.
//!
//! Hardware faults are reported as [`SeError::HardwareError`] and never
//! retried here.

use crate::error::SeError;
use crate::platform::{
    CounterValue, Digest, KeyMaterial, LifecycleState, SecureElement, SecurityLevel, Signature,
    VerifyingKey, UID_LEN,
};
use crate::protected_update::UpdateAuthority;
use crate::slots::{AccessPath, CounterId, KeySlot, ObjectId, SlotEntry, SlotMap, SlotOp, SlotRole};
use std::sync::{Mutex, MutexGuard};

/// Key used by [`FacadeGuard::verify`].
#[derive(Debug, Clone, Copy)]
pub enum VerifyKey<'k> {
    /// Public key of the key pair held in a slot
    Slot(KeySlot),
    /// Caller-supplied public key
    Public(&'k VerifyingKey),
}

/// Capability wrapper over a secure element.
pub struct SecureElementFacade {
    element: Mutex<Box<dyn SecureElement>>,
    slots: SlotMap,
    name: String,
    security_level: SecurityLevel,
}

impl SecureElementFacade {
    /// Wrap `element` with the slot table `slots`.
    pub fn new(element: Box<dyn SecureElement>, slots: SlotMap) -> Result<Self, SeError> {
        slots.validate()?;
        let name = element.name().to_string();
        let security_level = element.security_level();
        if security_level == SecurityLevel::Software {
            log::warn!("Using {} ({})", name, security_level);
        } else {
            log::info!("Using {} ({})", name, security_level);
        }
        Ok(Self {
            element: Mutex::new(element),
            slots,
            name,
            security_level,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn slots(&self) -> &SlotMap {
        &self.slots
    }

    /// Take exclusive ownership of the hardware bus.
    ///
    /// Blocks until any other holder releases its guard.
    pub fn acquire(&self) -> Result<FacadeGuard<'_>, SeError> {
        let element = self
            .element
            .lock()
            .map_err(|e| SeError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(FacadeGuard {
            element,
            slots: &self.slots,
        })
    }
}

/// Exclusive access to the secure element.
///
/// Dropping the guard releases the bus.
pub struct FacadeGuard<'a> {
    element: MutexGuard<'a, Box<dyn SecureElement>>,
    slots: &'a SlotMap,
}

impl<'a> FacadeGuard<'a> {
    pub fn slots(&self) -> &'a SlotMap {
        self.slots
    }

    /// Resolve `slot` for `op` on the public path.
    pub fn resolve(&self, slot: KeySlot, op: SlotOp) -> Result<SlotEntry, SeError> {
        self.slots.resolve(slot, op, AccessPath::Public).cloned()
    }

    fn data_entry(&self, slot: KeySlot, op: SlotOp, path: AccessPath) -> Result<SlotEntry, SeError> {
        let entry = self.slots.resolve(slot, op, path)?;
        if entry.role.is_key() {
            return Err(SeError::InvalidParam(format!(
                "slot {} holds a key, not data",
                slot
            )));
        }
        Ok(entry.clone())
    }

    fn key_entry(&self, slot: KeySlot, op: SlotOp) -> Result<SlotEntry, SeError> {
        let entry = self.slots.resolve(slot, op, AccessPath::Public)?;
        if !entry.role.is_key() || entry.role == SlotRole::AesKey {
            return Err(SeError::InvalidParam(format!(
                "slot {} does not hold an ECC key",
                slot
            )));
        }
        Ok(entry.clone())
    }

    /// Read a data slot into `buf`, returning the number of bytes copied.
    pub fn read(&mut self, slot: KeySlot, buf: &mut [u8]) -> Result<usize, SeError> {
        let data = self.read_vec(slot)?;
        if data.len() > buf.len() {
            return Err(SeError::InvalidParam(format!(
                "buffer of {} bytes too small for {} bytes in slot {}",
                buf.len(),
                data.len(),
                slot
            )));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Read the full contents of a data slot.
    pub fn read_vec(&mut self, slot: KeySlot) -> Result<Vec<u8>, SeError> {
        let entry = self.data_entry(slot, SlotOp::Read, AccessPath::Public)?;
        self.element.read_object(entry.object)
    }

    /// Replace the contents of a data slot.
    ///
    /// The capacity is checked before the bus is touched, so an oversized
    /// write leaves the slot untouched.
    pub fn write(&mut self, slot: KeySlot, data: &[u8]) -> Result<(), SeError> {
        let entry = self.data_entry(slot, SlotOp::Write, AccessPath::Public)?;
        entry.check_capacity(data.len())?;
        log::debug!("writing {} bytes to slot {} ({})", data.len(), slot, entry.object);
        self.element.write_object(entry.object, 0, data)
    }

    /// Generate a fresh P-256 keypair in an ECC key slot.
    pub fn generate_keypair(&mut self, slot: KeySlot) -> Result<VerifyingKey, SeError> {
        let entry = self.key_entry(slot, SlotOp::Write)?;
        self.element.generate_keypair(entry.object)
    }

    pub fn public_key(&mut self, slot: KeySlot) -> Result<VerifyingKey, SeError> {
        let entry = self.key_entry(slot, SlotOp::Use)?;
        self.element.public_key(entry.object)
    }

    /// Sign a SHA-256 digest with the key held in `slot`.
    pub fn sign(&mut self, slot: KeySlot, digest: &Digest) -> Result<Signature, SeError> {
        let entry = self.key_entry(slot, SlotOp::Use)?;
        self.element.sign_digest(entry.object, digest)
    }

    /// Verify a signature over a digest.
    pub fn verify(
        &mut self,
        key: VerifyKey<'_>,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, SeError> {
        let public = match key {
            VerifyKey::Slot(slot) => self.public_key(slot)?,
            VerifyKey::Public(public) => *public,
        };
        self.element.verify_digest(&public, digest, signature)
    }

    pub fn random(&mut self, out: &mut [u8]) -> Result<(), SeError> {
        self.element.random(out)
    }

    pub fn sha256(&mut self, data: &[u8]) -> Result<Digest, SeError> {
        self.element.sha256(data)
    }

    /// Read the 27-byte hardware UID.
    pub fn read_uid(&mut self) -> Result<Vec<u8>, SeError> {
        let uid = self.element.read_object(ObjectId::UID)?;
        if uid.len() != UID_LEN {
            return Err(SeError::HardwareError(format!(
                "UID object has {} bytes, expected {}",
                uid.len(),
                UID_LEN
            )));
        }
        Ok(uid)
    }

    pub fn read_lifecycle(&mut self) -> Result<LifecycleState, SeError> {
        let bytes = self.element.read_object(ObjectId::LIFECYCLE)?;
        bytes
            .first()
            .map(|b| LifecycleState::from_byte(*b))
            .ok_or_else(|| SeError::HardwareError("lifecycle object is empty".to_string()))
    }

    pub fn read_counter(&mut self, id: CounterId) -> Result<CounterValue, SeError> {
        self.element.read_counter(id.object())
    }

    pub fn increment_counter(&mut self, id: CounterId, step: u8) -> Result<CounterValue, SeError> {
        if step == 0 {
            return Err(SeError::InvalidParam("counter step must be 1..=255".to_string()));
        }
        self.element.increment_counter(id.object(), step)
    }

    /// Version recorded for `slot` by the last protected update.
    pub fn read_version(&mut self, slot: KeySlot) -> Result<u16, SeError> {
        let object = self.slots.resolve(slot, SlotOp::Read, AccessPath::Public)?.object;
        self.element.read_object_version(object)
    }

    /// Raw element access for operations that resolve their own slots.
    pub(crate) fn element(&mut self) -> &mut dyn SecureElement {
        &mut **self.element
    }

    /// Resolve a slot on the protected-update path.
    pub fn resolve_protected(
        &self,
        _authority: &UpdateAuthority,
        slot: KeySlot,
        op: SlotOp,
    ) -> Result<SlotEntry, SeError> {
        self.slots
            .resolve(slot, op, AccessPath::ProtectedUpdate)
            .cloned()
    }

    /// Fragment write on the protected-update path.
    ///
    /// Offset zero erases the slot first.
    pub fn write_protected(
        &mut self,
        _authority: &UpdateAuthority,
        slot: KeySlot,
        offset: usize,
        data: &[u8],
    ) -> Result<(), SeError> {
        let entry = self.data_entry(slot, SlotOp::Write, AccessPath::ProtectedUpdate)?;
        entry.check_capacity(offset + data.len())?;
        self.element.write_object(entry.object, offset, data)
    }

    /// Read a slot on the protected-update path, reserved slot included.
    pub fn read_protected(&mut self, _authority: &UpdateAuthority, slot: KeySlot) -> Result<Vec<u8>, SeError> {
        let entry = self.data_entry(slot, SlotOp::Read, AccessPath::ProtectedUpdate)?;
        self.element.read_object(entry.object)
    }

    /// Version tag of an update target, reserved slot included.
    pub fn read_version_protected(&mut self, authority: &UpdateAuthority, slot: KeySlot) -> Result<u16, SeError> {
        let entry = self.update_target(authority, slot)?;
        self.element.read_object_version(entry.object)
    }

    /// Record the version of an applied update in the target's metadata.
    pub fn record_version_protected(
        &mut self,
        authority: &UpdateAuthority,
        slot: KeySlot,
        version: u16,
    ) -> Result<(), SeError> {
        let entry = self.update_target(authority, slot)?;
        self.element.write_object_version(entry.object, version)
    }

    fn update_target(&self, authority: &UpdateAuthority, slot: KeySlot) -> Result<SlotEntry, SeError> {
        let entry = self.resolve_protected(authority, slot, SlotOp::Write)?;
        if !entry.updatable {
            return Err(SeError::InvalidParam(format!("slot {} is not an update target", slot)));
        }
        Ok(entry)
    }

    /// Install update-delivered key material into a key slot.
    pub fn install_key_protected(
        &mut self,
        authority: &UpdateAuthority,
        slot: KeySlot,
        material: KeyMaterial<'_>,
    ) -> Result<(), SeError> {
        let entry = self.resolve_protected(authority, slot, SlotOp::Write)?;
        if !entry.role.is_key() {
            return Err(SeError::InvalidParam(format!("slot {} does not hold a key", slot)));
        }
        let ok = match material {
            KeyMaterial::Aes(_) => entry.role == SlotRole::AesKey,
            KeyMaterial::EccP256(_) => entry.role != SlotRole::AesKey,
        };
        if !ok {
            return Err(SeError::InvalidParam(format!(
                "key type does not match slot {} role {:?}",
                slot, entry.role
            )));
        }
        self.element.install_key(entry.object, material)
    }

    /// HKDF over the reserved update secret.
    pub fn derive_from_update_secret(
        &mut self,
        authority: &UpdateAuthority,
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SeError> {
        let slot = self
            .slots
            .reserved_slot()
            .ok_or_else(|| SeError::Internal("slot map has no reserved slot".to_string()))?;
        let entry = self.resolve_protected(authority, slot, SlotOp::Use)?;
        self.element.hkdf_sha256(entry.object, salt, info, out)
    }
}
