/// Software-emulated secure element (development/testing only)
///
/// This implementation keeps every object in process memory without hardware
/// protection. It reproduces the object model of the real module: data objects
/// with offset writes, P-256 and AES key objects, 8-byte monotonic counters,
/// a 27-byte UID and a lifecycle byte.
///
/// # Security Warning
///
/// **NOT SUITABLE FOR PRODUCTION USE**
///
/// - Keys stored in process memory
/// - Vulnerable to memory dumps, debuggers, core files
/// - No physical security
///
/// Use only for:
/// - Development and testing
/// - The `seid` command-line emulator (state persisted as JSON)

use super::{
    AesKeySize, CounterValue, Digest, KeyMaterial, SecureElement, SecurityLevel, Signature,
    VerifyingKey, COUNTER_WRITE_BUDGET, MAX_OBJECT_VERSION, UID_LEN,
};
use crate::error::SeError;
use crate::slots::{CounterId, ObjectId};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Largest object the emulated element accepts.
const MAX_OBJECT_LEN: usize = 1728;

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredObject {
    Data {
        #[serde(with = "hex::serde")]
        bytes: Vec<u8>,
    },
    EccKey {
        #[serde(with = "hex::serde")]
        scalar: Vec<u8>,
    },
    AesKey {
        #[serde(with = "hex::serde")]
        key: Vec<u8>,
    },
}

impl Drop for StoredObject {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        match self {
            StoredObject::EccKey { scalar } => scalar.zeroize(),
            StoredObject::AesKey { key } => key.zeroize(),
            StoredObject::Data { .. } => {}
        }
    }
}

/// Serializable contents of the emulated element.
#[derive(Clone, Serialize, Deserialize)]
struct SoftwareState {
    objects: BTreeMap<ObjectId, StoredObject>,
    /// Metadata version tags, kept apart from contents
    #[serde(default)]
    versions: BTreeMap<ObjectId, u16>,
}

/// Shared observation and fault-injection handle.
///
/// The element is usually moved into a facade as a trait object; tests keep a
/// probe to count hardware writes and to simulate bus faults.
#[derive(Debug)]
pub struct SoftwareProbe {
    writes: AtomicU64,
    offline: AtomicBool,
    fail_writes_after: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl SoftwareProbe {
    fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            fail_writes_after: AtomicU64::new(u64::MAX),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Number of state-changing transactions performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every transaction fail with a hardware error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail every write once `count` total writes have been performed.
    pub fn fail_writes_after(&self, count: u64) {
        self.fail_writes_after.store(count, Ordering::SeqCst);
    }

    /// Stall each object write, widening race windows in tests.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// In-memory secure element.
///
/// # Example
///
/// ```ignore
/// use seid::platform::software::SoftwareSecureElement;
/// use seid::platform::SecureElement;
///
/// let mut se = SoftwareSecureElement::new()?;
/// let uid = se.read_object(ObjectId::UID)?;
/// ```
pub struct SoftwareSecureElement {
    state: SoftwareState,
    probe: Arc<SoftwareProbe>,
    state_file: Option<PathBuf>,
}

impl SoftwareSecureElement {
    /// Create an element with a random UID, a factory key and fresh counters.
    pub fn new() -> Result<Self, SeError> {
        let mut uid = [0u8; UID_LEN];
        getrandom::getrandom(&mut uid)
            .map_err(|e| SeError::HardwareError(format!("TRNG failure: {}", e)))?;
        Self::with_uid(&uid)
    }

    /// Create an element with a fixed UID.
    pub fn with_uid(uid: &[u8]) -> Result<Self, SeError> {
        if uid.len() != UID_LEN {
            return Err(SeError::InvalidParam(format!(
                "UID must be {} bytes, got {}",
                UID_LEN,
                uid.len()
            )));
        }

        log::warn!(
            "Creating software secure element - NOT SUITABLE FOR PRODUCTION. \
             Keys are stored in process memory without hardware protection."
        );

        let mut objects = BTreeMap::new();
        objects.insert(ObjectId::UID, StoredObject::Data { bytes: uid.to_vec() });
        objects.insert(ObjectId::LIFECYCLE, StoredObject::Data { bytes: vec![0x07] });
        for id in 0..CounterId::COUNT {
            let counter = CounterId::new(id)?;
            objects.insert(
                counter.object(),
                StoredObject::Data {
                    bytes: CounterValue::new(0, COUNTER_WRITE_BUDGET).to_bytes().to_vec(),
                },
            );
        }
        let factory_key = SigningKey::random(&mut OsRng);
        objects.insert(
            ObjectId(0xE0F0),
            StoredObject::EccKey {
                scalar: factory_key.to_bytes().to_vec(),
            },
        );

        Ok(Self {
            state: SoftwareState {
                objects,
                versions: BTreeMap::new(),
            },
            probe: Arc::new(SoftwareProbe::new()),
            state_file: None,
        })
    }

    /// Handle for counting writes and injecting faults.
    pub fn probe(&self) -> Arc<SoftwareProbe> {
        self.probe.clone()
    }

    /// Factory-time write that bypasses all access rules.
    ///
    /// Used to place factory certificates and initial secrets before the
    /// element is handed to a facade.
    pub fn provision_object(&mut self, object: ObjectId, data: &[u8]) {
        self.state.objects.insert(object, StoredObject::Data { bytes: data.to_vec() });
    }

    /// Factory-time key injection.
    pub fn provision_ecc_key(&mut self, object: ObjectId, key: &SigningKey) {
        self.state.objects.insert(
            object,
            StoredObject::EccKey {
                scalar: key.to_bytes().to_vec(),
            },
        );
    }

    pub fn set_lifecycle(&mut self, state: super::LifecycleState) {
        self.provision_object(ObjectId::LIFECYCLE, &[state.as_byte()]);
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>, SeError> {
        serde_json::to_vec_pretty(&self.state)
            .map_err(|e| SeError::Internal(format!("Failed to serialize element: {}", e)))
    }

    /// Deserialize from JSON
    pub fn from_json(data: &[u8]) -> Result<Self, SeError> {
        let state: SoftwareState = serde_json::from_slice(data)
            .map_err(|e| SeError::Parse(format!("Failed to parse element state: {}", e)))?;
        if !state.objects.contains_key(&ObjectId::UID) {
            return Err(SeError::Parse("element state has no UID object".to_string()));
        }
        Ok(Self {
            state,
            probe: Arc::new(SoftwareProbe::new()),
            state_file: None,
        })
    }

    /// Load the element persisted at `path`, or create a fresh one there.
    ///
    /// Every later write transaction rewrites the file.
    pub fn open_state_file(path: impl AsRef<Path>) -> Result<Self, SeError> {
        let path = path.as_ref();
        let mut element = if path.exists() {
            Self::from_json(&std::fs::read(path)?)?
        } else {
            let element = Self::new()?;
            std::fs::write(path, element.to_json()?)?;
            log::info!("Created emulator state in {}", path.display());
            element
        };
        element.state_file = Some(path.to_path_buf());
        Ok(element)
    }

    fn check_online(&self) -> Result<(), SeError> {
        if self.probe.offline.load(Ordering::SeqCst) {
            return Err(SeError::HardwareError(
                "secure element not responding".to_string(),
            ));
        }
        Ok(())
    }

    fn begin_write(&self) -> Result<(), SeError> {
        self.check_online()?;
        if self.probe.writes() >= self.probe.fail_writes_after.load(Ordering::SeqCst) {
            return Err(SeError::HardwareError("write transaction failed".to_string()));
        }
        let delay = self.probe.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(())
    }

    fn commit_write(&self) -> Result<(), SeError> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(path) = &self.state_file {
            std::fs::write(path, self.to_json()?)?;
        }
        Ok(())
    }

    fn data(&self, object: ObjectId) -> Result<&[u8], SeError> {
        match self.state.objects.get(&object) {
            Some(StoredObject::Data { bytes }) => Ok(bytes),
            Some(_) => Err(SeError::HardwareError(format!(
                "object {} holds a key",
                object
            ))),
            None => Ok(&[]),
        }
    }

    fn signing_key(&self, object: ObjectId) -> Result<SigningKey, SeError> {
        match self.state.objects.get(&object) {
            Some(StoredObject::EccKey { scalar }) => SigningKey::from_slice(scalar)
                .map_err(|e| SeError::HardwareError(format!("corrupt key in {}: {}", object, e))),
            _ => Err(SeError::KeyNotFound(format!("no ECC key in {}", object))),
        }
    }

    fn aes_key(&self, object: ObjectId) -> Result<&[u8], SeError> {
        match self.state.objects.get(&object) {
            Some(StoredObject::AesKey { key }) => Ok(key),
            _ => Err(SeError::KeyNotFound(format!("no AES key in {}", object))),
        }
    }

    fn secret(&self, object: ObjectId) -> Result<&[u8], SeError> {
        let bytes = self.data(object)?;
        if bytes.is_empty() {
            return Err(SeError::KeyNotFound(format!("secret object {} is empty", object)));
        }
        Ok(bytes)
    }
}

fn cbc_block_check(data: &[u8]) -> Result<(), SeError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(SeError::InvalidParam(format!(
            "AES-CBC input must be a non-zero multiple of 16 bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

fn cbc_encrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError> {
    let bad_key = |e| SeError::HardwareError(format!("AES key setup failed: {}", e));
    Ok(match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<NoPadding>(data),
        n => return Err(SeError::HardwareError(format!("invalid AES key length {}", n))),
    })
}

fn cbc_decrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError> {
    let bad_key = |e| SeError::HardwareError(format!("AES key setup failed: {}", e));
    let unpad = |_| SeError::HardwareError("AES-CBC decryption failed".to_string());
    match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(unpad),
        n => Err(SeError::HardwareError(format!("invalid AES key length {}", n))),
    }
}

impl SecureElement for SoftwareSecureElement {
    fn name(&self) -> &str {
        "Software Secure Element (Development Only)"
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Software
    }

    fn read_object(&mut self, object: ObjectId) -> Result<Vec<u8>, SeError> {
        self.check_online()?;
        Ok(self.data(object)?.to_vec())
    }

    fn write_object(&mut self, object: ObjectId, offset: usize, data: &[u8]) -> Result<(), SeError> {
        self.begin_write()?;
        if offset + data.len() > MAX_OBJECT_LEN {
            return Err(SeError::HardwareError(format!(
                "write past end of object {}",
                object
            )));
        }

        let mut bytes = if offset == 0 {
            Vec::new()
        } else {
            self.data(object)?.to_vec()
        };
        if bytes.len() < offset {
            return Err(SeError::HardwareError(format!(
                "write offset {} beyond object {} length {}",
                offset,
                object,
                bytes.len()
            )));
        }
        bytes.truncate(offset);
        bytes.extend_from_slice(data);
        self.state.objects.insert(object, StoredObject::Data { bytes });
        self.commit_write()?;
        Ok(())
    }

    fn random(&mut self, out: &mut [u8]) -> Result<(), SeError> {
        self.check_online()?;
        getrandom::getrandom(out).map_err(|e| SeError::HardwareError(format!("TRNG failure: {}", e)))
    }

    fn generate_keypair(&mut self, object: ObjectId) -> Result<VerifyingKey, SeError> {
        self.begin_write()?;
        let key = SigningKey::random(&mut OsRng);
        let public = *key.verifying_key();
        self.state.objects.insert(
            object,
            StoredObject::EccKey {
                scalar: key.to_bytes().to_vec(),
            },
        );
        self.commit_write()?;
        log::debug!("generated P-256 keypair in {}", object);
        Ok(public)
    }

    fn public_key(&mut self, object: ObjectId) -> Result<VerifyingKey, SeError> {
        self.check_online()?;
        Ok(*self.signing_key(object)?.verifying_key())
    }

    fn sign_digest(&mut self, object: ObjectId, digest: &Digest) -> Result<Signature, SeError> {
        self.check_online()?;
        let key = self.signing_key(object)?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| SeError::HardwareError(format!("signing failed: {}", e)))?;
        Ok(signature)
    }

    fn verify_digest(
        &mut self,
        key: &VerifyingKey,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<bool, SeError> {
        self.check_online()?;
        Ok(key.verify_prehash(digest, signature).is_ok())
    }

    fn ecdh(&mut self, object: ObjectId, peer: &p256::PublicKey) -> Result<Zeroizing<Vec<u8>>, SeError> {
        self.check_online()?;
        let key = self.signing_key(object)?;
        let shared = p256::ecdh::diffie_hellman(key.as_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    fn generate_aes_key(&mut self, object: ObjectId, size: AesKeySize) -> Result<(), SeError> {
        self.begin_write()?;
        let mut key = vec![0u8; size.key_len()];
        getrandom::getrandom(&mut key)
            .map_err(|e| SeError::HardwareError(format!("TRNG failure: {}", e)))?;
        self.state.objects.insert(object, StoredObject::AesKey { key });
        self.commit_write()?;
        Ok(())
    }

    fn aes_cbc_encrypt(&mut self, object: ObjectId, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError> {
        self.check_online()?;
        cbc_block_check(data)?;
        cbc_encrypt(self.aes_key(object)?, iv, data)
    }

    fn aes_cbc_decrypt(&mut self, object: ObjectId, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, SeError> {
        self.check_online()?;
        cbc_block_check(data)?;
        cbc_decrypt(self.aes_key(object)?, iv, data)
    }

    fn hmac_sha256(&mut self, secret: ObjectId, data: &[u8]) -> Result<[u8; 32], SeError> {
        self.check_online()?;
        Ok(hmac_sha256::HMAC::mac(data, self.secret(secret)?))
    }

    fn hkdf_sha256(
        &mut self,
        secret: ObjectId,
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SeError> {
        self.check_online()?;
        let salt = if salt.is_empty() { None } else { Some(salt) };
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(salt, self.secret(secret)?);
        hk.expand(info, out)
            .map_err(|_| SeError::InvalidParam(format!("HKDF output length {} too large", out.len())))
    }

    fn sha256(&mut self, data: &[u8]) -> Result<Digest, SeError> {
        self.check_online()?;
        Ok(hmac_sha256::Hash::hash(data))
    }

    fn install_key(&mut self, object: ObjectId, material: KeyMaterial<'_>) -> Result<(), SeError> {
        self.begin_write()?;
        let stored = match material {
            KeyMaterial::EccP256(scalar) => {
                SigningKey::from_slice(scalar)
                    .map_err(|_| SeError::InvalidParam("invalid P-256 private scalar".to_string()))?;
                StoredObject::EccKey {
                    scalar: scalar.to_vec(),
                }
            }
            KeyMaterial::Aes(key) => {
                if !matches!(key.len(), 16 | 24 | 32) {
                    return Err(SeError::InvalidParam(format!(
                        "invalid AES key length {}",
                        key.len()
                    )));
                }
                StoredObject::AesKey { key: key.to_vec() }
            }
        };
        self.state.objects.insert(object, stored);
        self.commit_write()?;
        Ok(())
    }

    fn increment_counter(&mut self, counter: ObjectId, step: u8) -> Result<CounterValue, SeError> {
        self.begin_write()?;
        let mut current = CounterValue::from_bytes(self.data(counter)?)?;
        let next = current.value.checked_add(step as u32).unwrap_or(u32::MAX);
        if next > current.threshold {
            return Err(SeError::HardwareError(format!(
                "counter {} would exceed its threshold {}",
                counter, current.threshold
            )));
        }
        current.value = next;
        self.state.objects.insert(
            counter,
            StoredObject::Data {
                bytes: current.to_bytes().to_vec(),
            },
        );
        self.commit_write()?;
        Ok(current)
    }

    fn read_object_version(&mut self, object: ObjectId) -> Result<u16, SeError> {
        self.check_online()?;
        Ok(self.state.versions.get(&object).copied().unwrap_or(0))
    }

    fn write_object_version(&mut self, object: ObjectId, version: u16) -> Result<(), SeError> {
        self.begin_write()?;
        if version > MAX_OBJECT_VERSION {
            return Err(SeError::InvalidParam(format!(
                "version {} does not fit the metadata tag (max {})",
                version, MAX_OBJECT_VERSION
            )));
        }
        let current = self.state.versions.get(&object).copied().unwrap_or(0);
        if version < current {
            return Err(SeError::VersionStale {
                current: current as u32,
                offered: version as u32,
            });
        }
        self.state.versions.insert(object, version);
        self.commit_write()?;
        Ok(())
    }
}
