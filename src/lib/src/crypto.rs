//! Crypto utility layer
//!
//! Every operation follows the same shape: check the license gate, take the
//! bus guard, perform one hardware transaction, release the guard. Parameter
//! errors are reported as [`SeError::InvalidParam`] and never reach the bus.

use crate::audit;
use crate::device::SecureDevice;
use crate::error::SeError;
use crate::facade::{FacadeGuard, VerifyKey};
use crate::platform::{AesKeySize, Digest, Signature, VerifyingKey};
use crate::slots::{KeySlot, SlotEntry, SlotOp, SlotRole};
use zeroize::Zeroizing;

/// Bounds of [`SecureDevice::random`].
pub const RANDOM_MIN_LEN: usize = 8;
pub const RANDOM_MAX_LEN: usize = 256;

/// Largest HKDF output.
pub const HKDF_MAX_LEN: usize = 256;

pub const AES_BLOCK_LEN: usize = 16;

/// Result of [`SecureDevice::aes_encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesCiphertext {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; AES_BLOCK_LEN],
}

fn check_block_aligned(data: &[u8]) -> Result<(), SeError> {
    if data.is_empty() || data.len() % AES_BLOCK_LEN != 0 {
        return Err(SeError::InvalidParam(format!(
            "AES-CBC data must be a non-zero multiple of {} bytes, got {}",
            AES_BLOCK_LEN,
            data.len()
        )));
    }
    Ok(())
}

/// Resolve a data-store slot for `op`. Reserved slots fail with `ReservedSlot`.
fn data_store_entry(guard: &FacadeGuard<'_>, slot: KeySlot, op: SlotOp) -> Result<SlotEntry, SeError> {
    let entry = guard.resolve(slot, op)?;
    if entry.role != SlotRole::DataStore {
        return Err(SeError::InvalidParam(format!(
            "slot {} is not a data-store slot",
            slot
        )));
    }
    Ok(entry)
}

fn aes_entry(guard: &FacadeGuard<'_>, op: SlotOp) -> Result<SlotEntry, SeError> {
    let slot = guard
        .slots()
        .slot_for_role(SlotRole::AesKey)
        .ok_or_else(|| SeError::InvalidParam("slot map has no AES key slot".to_string()))?;
    guard.resolve(slot, op)
}

impl SecureDevice {
    /// Draw `len` bytes from the element's TRNG.
    pub fn random(&self, len: usize) -> Result<Vec<u8>, SeError> {
        let mut se = self.session()?;
        if !(RANDOM_MIN_LEN..=RANDOM_MAX_LEN).contains(&len) {
            return Err(SeError::InvalidParam(format!(
                "random length must be {}..={}, got {}",
                RANDOM_MIN_LEN, RANDOM_MAX_LEN, len
            )));
        }
        let mut out = vec![0u8; len];
        se.random(&mut out)?;
        Ok(out)
    }

    /// Generate a fresh AES key in the AES key object.
    pub fn aes_generate_key(&self, bits: u16) -> Result<(), SeError> {
        let mut se = self.session()?;
        let size = AesKeySize::from_bits(bits)?;
        let entry = aes_entry(&se, SlotOp::Write)?;
        se.element().generate_aes_key(entry.object, size)?;
        audit::log_key_generation(entry.slot.0, &format!("AES-{}", bits));
        Ok(())
    }

    /// AES-CBC encrypt without padding.
    ///
    /// A random IV is drawn when `iv` is `None`.
    pub fn aes_encrypt(
        &self,
        plaintext: &[u8],
        iv: Option<[u8; AES_BLOCK_LEN]>,
    ) -> Result<AesCiphertext, SeError> {
        let mut se = self.session()?;
        check_block_aligned(plaintext)?;
        let entry = aes_entry(&se, SlotOp::Use)?;
        let iv = match iv {
            Some(iv) => iv,
            None => {
                let mut iv = [0u8; AES_BLOCK_LEN];
                se.random(&mut iv)?;
                iv
            }
        };
        let ciphertext = se.element().aes_cbc_encrypt(entry.object, &iv, plaintext)?;
        Ok(AesCiphertext { ciphertext, iv })
    }

    pub fn aes_decrypt(&self, ciphertext: &[u8], iv: &[u8; AES_BLOCK_LEN]) -> Result<Vec<u8>, SeError> {
        let mut se = self.session()?;
        check_block_aligned(ciphertext)?;
        let entry = aes_entry(&se, SlotOp::Use)?;
        se.element().aes_cbc_decrypt(entry.object, iv, ciphertext)
    }

    /// HMAC-SHA256 keyed by the secret stored in a data-store slot.
    pub fn hmac_sha256(&self, secret_slot: KeySlot, data: &[u8]) -> Result<[u8; 32], SeError> {
        let mut se = self.session()?;
        let entry = data_store_entry(&se, secret_slot, SlotOp::Use)?;
        se.element().hmac_sha256(entry.object, data)
    }

    /// ECDH with a session key. Identity and factory keys are refused.
    pub fn ecdh_shared_secret(
        &self,
        key_slot: KeySlot,
        peer: &p256::PublicKey,
    ) -> Result<Zeroizing<Vec<u8>>, SeError> {
        let mut se = self.session()?;
        let entry = se.resolve(key_slot, SlotOp::Use)?;
        if entry.role != SlotRole::SessionKey {
            return Err(SeError::InvalidParam(format!(
                "ECDH requires a session key slot, slot {} is {:?}",
                key_slot, entry.role
            )));
        }
        se.element().ecdh(entry.object, peer)
    }

    /// HKDF-SHA256 over the secret in a data-store slot.
    pub fn hkdf_derive(
        &self,
        secret_slot: KeySlot,
        salt: &[u8],
        info: &[u8],
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, SeError> {
        let mut se = self.session()?;
        if !(1..=HKDF_MAX_LEN).contains(&out_len) {
            return Err(SeError::InvalidParam(format!(
                "HKDF output length must be 1..={}, got {}",
                HKDF_MAX_LEN, out_len
            )));
        }
        let entry = data_store_entry(&se, secret_slot, SlotOp::Use)?;
        let mut out = Zeroizing::new(vec![0u8; out_len]);
        se.element().hkdf_sha256(entry.object, salt, info, &mut out)?;
        Ok(out)
    }

    pub fn hash(&self, data: &[u8]) -> Result<Digest, SeError> {
        self.session()?.sha256(data)
    }

    /// SHA-256 then ECDSA with the key in `slot`.
    pub fn sign_data(&self, slot: KeySlot, data: &[u8]) -> Result<Signature, SeError> {
        let mut se = self.session()?;
        let digest = se.sha256(data)?;
        se.sign(slot, &digest)
    }

    pub fn verify_data(&self, key: VerifyKey<'_>, data: &[u8], signature: &Signature) -> Result<bool, SeError> {
        let mut se = self.session()?;
        let digest = se.sha256(data)?;
        se.verify(key, &digest, signature)
    }

    /// Generate a P-256 keypair in an ECC key slot.
    pub fn generate_keypair(&self, slot: KeySlot) -> Result<VerifyingKey, SeError> {
        let public = self.session()?.generate_keypair(slot)?;
        audit::log_key_generation(slot.0, "ECC-P256");
        Ok(public)
    }

    pub fn public_key(&self, slot: KeySlot) -> Result<VerifyingKey, SeError> {
        self.session()?.public_key(slot)
    }

    /// Store `data` in a data-store slot, replacing previous contents.
    pub fn secure_store_write(&self, slot: KeySlot, data: &[u8]) -> Result<(), SeError> {
        let mut se = self.session()?;
        data_store_entry(&se, slot, SlotOp::Write)?;
        se.write(slot, data)
    }

    pub fn secure_store_read(&self, slot: KeySlot) -> Result<Vec<u8>, SeError> {
        let mut se = self.session()?;
        data_store_entry(&se, slot, SlotOp::Read)?;
        se.read_vec(slot)
    }

    /// Capacity in bytes of a data-store slot.
    pub fn secure_store_capacity(&self, slot: KeySlot) -> Result<usize, SeError> {
        let se = self.session()?;
        Ok(data_store_entry(&se, slot, SlotOp::Read)?.capacity)
    }
}
