//! Protected updates
//!
//! A protected update rewrites a secure-element object (certificate, trust
//! anchor, symmetric key, update secret) from a manifest signed by the trust
//! anchor. Nothing is written until the manifest signature, the target's
//! recorded version and the content hash of the whole payload have been
//! checked. The version lives in the target object's metadata, so every
//! updatable slot rolls forward on its own.
//!
//! ```text
//! Idle → WaitManifest ──────────────────────────────────┐
//!   └──→ WaitJsonBundle → ProcessJsonBundle → WriteTrustAnchor
//!                                                       ▼
//!                          VerifyManifest → ApplyFragments → Complete
//! ```
//!
//! Any step may end in `Error`. After `Complete` or `Error` the driver
//! publishes an acknowledgement on the `ack` channel.
//!
//! Writes below this module go through the facade's protected path, which
//! requires an [`UpdateAuthority`]. Only this module can create one.

pub mod bundle;
pub mod manifest;

pub use bundle::{JsonBundle, UpdatePackage};
pub use manifest::{Manifest, ManifestBuilder, PayloadType, MAX_FRAGMENTS, MAX_FRAGMENT_LEN, MAX_MANIFEST_LEN};

use crate::audit;
use crate::device::SecureDevice;
use crate::error::{ErrorKind, SeError};
use crate::facade::{FacadeGuard, VerifyKey};
use crate::platform::{KeyMaterial, VerifyingKey, MAX_OBJECT_VERSION};
use crate::slots::{KeySlot, SlotEntry, SlotOp, SlotRole};
use crate::transport::{Channels, Transport};
use crate::workflow::{thread_sleeper, RetryBudget, Sleeper, WorkflowError};
use p256::pkcs8::DecodePublicKey;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Proof that a write is made on behalf of a verified protected update.
pub struct UpdateAuthority {
    _private: (),
}

impl UpdateAuthority {
    fn new() -> Self {
        Self { _private: () }
    }
}

/// An update that passed every check and is ready to be written.
#[derive(Clone, PartialEq)]
pub struct VerifiedUpdate {
    pub target: KeySlot,
    pub version: u32,
    pub payload_type: PayloadType,
    /// Number of fragments delivered
    pub fragments: usize,
    chunks: Vec<Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for VerifiedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedUpdate")
            .field("target", &self.target)
            .field("version", &self.version)
            .field("payload_type", &self.payload_type)
            .field("fragments", &self.fragments)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Idle,
    WaitManifest {
        budget: RetryBudget,
        waits: u32,
        attempt: u32,
    },
    WaitJsonBundle {
        budget: RetryBudget,
        waits: u32,
        attempt: u32,
    },
    ProcessJsonBundle {
        bundle: Vec<u8>,
    },
    WriteTrustAnchor {
        bundle: JsonBundle,
    },
    VerifyManifest {
        package: UpdatePackage,
    },
    ApplyFragments {
        update: VerifiedUpdate,
    },
    Complete {
        target: KeySlot,
        version: u32,
    },
    Error(WorkflowError),
}

impl UpdateState {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::WaitManifest { .. } => "wait_manifest",
            UpdateState::WaitJsonBundle { .. } => "wait_json_bundle",
            UpdateState::ProcessJsonBundle { .. } => "process_json_bundle",
            UpdateState::WriteTrustAnchor { .. } => "write_trust_anchor",
            UpdateState::VerifyManifest { .. } => "verify_manifest",
            UpdateState::ApplyFragments { .. } => "apply_fragments",
            UpdateState::Complete { .. } => "complete",
            UpdateState::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Idle | UpdateState::Complete { .. } | UpdateState::Error(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Wait for a CBOR package
    Start(RetryBudget),
    /// Wait for a JSON bootstrap bundle
    StartBootstrap(RetryBudget),
    PackageReceived(UpdatePackage),
    BundleReceived(Vec<u8>),
    WaitExpired,
    BundleParsed(JsonBundle),
    TrustAnchorWritten,
    ManifestVerified(VerifiedUpdate),
    Applied,
    Failed(WorkflowError),
    Reset,
}

impl UpdateEvent {
    fn name(&self) -> &'static str {
        match self {
            UpdateEvent::Start(_) => "start",
            UpdateEvent::StartBootstrap(_) => "start_bootstrap",
            UpdateEvent::PackageReceived(_) => "package_received",
            UpdateEvent::BundleReceived(_) => "bundle_received",
            UpdateEvent::WaitExpired => "wait_expired",
            UpdateEvent::BundleParsed(_) => "bundle_parsed",
            UpdateEvent::TrustAnchorWritten => "trust_anchor_written",
            UpdateEvent::ManifestVerified(_) => "manifest_verified",
            UpdateEvent::Applied => "applied",
            UpdateEvent::Failed(_) => "failed",
            UpdateEvent::Reset => "reset",
        }
    }
}

fn timeout() -> UpdateState {
    UpdateState::Error(WorkflowError::new(&SeError::Timeout(
        "no update received".to_string(),
    )))
}

/// The protected update state machine.
pub fn transition(state: UpdateState, event: UpdateEvent) -> UpdateState {
    use UpdateEvent as E;
    use UpdateState as S;

    match (state, event) {
        (_, E::Reset) => S::Idle,

        (S::Idle | S::Complete { .. } | S::Error(_), E::Start(budget)) => S::WaitManifest {
            budget,
            waits: 0,
            attempt: 0,
        },
        (S::Idle | S::Complete { .. } | S::Error(_), E::StartBootstrap(budget)) => S::WaitJsonBundle {
            budget,
            waits: 0,
            attempt: 0,
        },

        (S::WaitManifest { .. }, E::PackageReceived(package)) => S::VerifyManifest { package },
        (S::WaitJsonBundle { .. }, E::BundleReceived(bundle)) => S::ProcessJsonBundle { bundle },

        (S::WaitManifest { budget, waits, attempt }, E::WaitExpired) => {
            if budget.allows_another_wait(waits) {
                S::WaitManifest {
                    budget,
                    waits: waits + 1,
                    attempt,
                }
            } else {
                timeout()
            }
        }
        (S::WaitJsonBundle { budget, waits, attempt }, E::WaitExpired) => {
            if budget.allows_another_wait(waits) {
                S::WaitJsonBundle {
                    budget,
                    waits: waits + 1,
                    attempt,
                }
            } else {
                timeout()
            }
        }
        (S::WaitManifest { budget, waits, attempt }, E::Failed(e))
            if e.kind == ErrorKind::Transport && budget.allows_transport_retry(attempt) =>
        {
            S::WaitManifest {
                budget,
                waits,
                attempt: attempt + 1,
            }
        }
        (S::WaitJsonBundle { budget, waits, attempt }, E::Failed(e))
            if e.kind == ErrorKind::Transport && budget.allows_transport_retry(attempt) =>
        {
            S::WaitJsonBundle {
                budget,
                waits,
                attempt: attempt + 1,
            }
        }

        (S::ProcessJsonBundle { .. }, E::BundleParsed(bundle)) => S::WriteTrustAnchor { bundle },
        (S::WriteTrustAnchor { bundle }, E::TrustAnchorWritten) => S::VerifyManifest {
            package: bundle.package,
        },

        (S::VerifyManifest { .. }, E::ManifestVerified(update)) => S::ApplyFragments { update },
        (S::ApplyFragments { update }, E::Applied) => S::Complete {
            target: update.target,
            version: update.version,
        },

        (_, E::Failed(e)) => S::Error(e),
        (state, E::Start(_) | E::StartBootstrap(_)) => state,
        (state, event) => S::Error(WorkflowError::unexpected(state.name(), event.name())),
    }
}

/// Acknowledgement published after an update round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateAck {
    /// `"complete"` or `"error"`
    pub status: &'static str,
    pub target: Option<u8>,
    pub version: Option<u32>,
    pub code: i32,
    pub detail: String,
}

/// Public key of the trust anchor: a DER certificate or a bare SPKI.
pub fn trust_anchor_key(bytes: &[u8]) -> Result<VerifyingKey, SeError> {
    if bytes.is_empty() {
        return Err(SeError::Certificate("no trust anchor provisioned".to_string()));
    }
    if let Ok((_, cert)) = x509_parser::parse_x509_certificate(bytes) {
        return VerifyingKey::from_sec1_bytes(&cert.public_key().subject_public_key.data)
            .map_err(|e| SeError::Certificate(format!("trust anchor key: {}", e)));
    }
    VerifyingKey::from_public_key_der(bytes)
        .map_err(|e| SeError::Certificate(format!("trust anchor is neither a certificate nor a key: {}", e)))
}

fn check_payload_type(entry: &SlotEntry, payload_type: PayloadType) -> Result<(), SeError> {
    let ok = match payload_type {
        PayloadType::Data => matches!(entry.role, SlotRole::DataStore | SlotRole::UpdateSecret),
        PayloadType::Cert => entry.role.is_certificate(),
        PayloadType::Key => entry.role.is_key() && entry.role != SlotRole::FactoryKey,
        PayloadType::Metadata => {
            return Err(SeError::InvalidParam(
                "metadata updates are not supported".to_string(),
            ))
        }
    };
    if !ok {
        return Err(SeError::InvalidParam(format!(
            "{:?} payload cannot target slot {} ({:?})",
            payload_type, entry.slot, entry.role
        )));
    }
    Ok(())
}

/// Compare `version` with the tag recorded for `target`.
fn check_version(se: &mut FacadeGuard<'_>, target: KeySlot, version: u32) -> Result<u16, SeError> {
    let offered = u16::try_from(version)
        .ok()
        .filter(|v| *v <= MAX_OBJECT_VERSION)
        .ok_or_else(|| {
            SeError::InvalidParam(format!(
                "version {} is outside the recordable range 0..={}",
                version, MAX_OBJECT_VERSION
            ))
        })?;
    let current = se.read_version_protected(&UpdateAuthority::new(), target)?;
    if offered < current {
        return Err(SeError::VersionStale {
            current: current as u32,
            offered: version,
        });
    }
    Ok(offered)
}

/// Run every pre-write check on `package`.
fn verify_package(se: &mut FacadeGuard<'_>, package: &UpdatePackage) -> Result<VerifiedUpdate, SeError> {
    let authority = UpdateAuthority::new();
    package.check_limits()?;
    let manifest = Manifest::parse(&package.manifest)?;
    let payload = &manifest.payload;

    let anchor = se.read_vec(KeySlot::TRUST_ANCHOR)?;
    let key = trust_anchor_key(&anchor)?;
    if !se.verify(VerifyKey::Public(&key), &manifest.digest(), manifest.signature())? {
        return Err(SeError::SignatureInvalid(
            "manifest is not signed by the trust anchor".to_string(),
        ));
    }

    let entry = se.resolve_protected(&authority, payload.target_slot, SlotOp::Write)?;
    check_payload_type(&entry, payload.payload_type)?;
    check_version(se, entry.slot, payload.version)?;

    if package.fragments.len() != payload.fragments as usize {
        return Err(SeError::InvalidParam(format!(
            "manifest announces {} fragments, got {}",
            payload.fragments,
            package.fragments.len()
        )));
    }
    let delivered: Zeroizing<Vec<u8>> =
        Zeroizing::new(package.fragments.iter().flat_map(|f| f.iter().copied()).collect());
    if delivered.len() != payload.length as usize {
        return Err(SeError::InvalidParam(format!(
            "manifest announces {} bytes, got {}",
            payload.length,
            delivered.len()
        )));
    }

    let chunks: Vec<Zeroizing<Vec<u8>>> = match &payload.encryption {
        None => package
            .fragments
            .iter()
            .map(|f| Zeroizing::new(f.to_vec()))
            .collect(),
        Some(enc) => {
            let mut key = Zeroizing::new([0u8; 32]);
            se.derive_from_update_secret(&authority, &enc.salt, manifest::UPDATE_KEY_INFO, &mut key[..])?;
            let plain = manifest::decrypt_payload(&key, payload, &delivered)?;
            plain
                .chunks(MAX_FRAGMENT_LEN)
                .map(|c| Zeroizing::new(c.to_vec()))
                .collect()
        }
    };

    let mut plaintext = Zeroizing::new(Vec::with_capacity(delivered.len()));
    for chunk in &chunks {
        plaintext.extend_from_slice(chunk);
    }
    let hash = se.sha256(&plaintext)?;
    if !bool::from(hash[..].ct_eq(&payload.content_hash[..])) {
        return Err(SeError::SignatureInvalid("content hash mismatch".to_string()));
    }

    match payload.payload_type {
        PayloadType::Key if chunks.len() != 1 => {
            return Err(SeError::InvalidParam(
                "key updates carry exactly one fragment".to_string(),
            ))
        }
        PayloadType::Key => {}
        _ => entry.check_capacity(plaintext.len())?,
    }

    Ok(VerifiedUpdate {
        target: payload.target_slot,
        version: payload.version,
        payload_type: payload.payload_type,
        fragments: package.fragments.len(),
        chunks,
    })
}

/// Write a verified update, then record its version on the target. The
/// caller's guard is held for the whole operation.
fn apply_update(se: &mut FacadeGuard<'_>, update: &VerifiedUpdate) -> Result<(), SeError> {
    let authority = UpdateAuthority::new();
    let version = check_version(se, update.target, update.version)?;

    match update.payload_type {
        PayloadType::Key => {
            let entry = se.resolve_protected(&authority, update.target, SlotOp::Write)?;
            let key = update
                .chunks
                .first()
                .ok_or_else(|| SeError::Internal("empty key update".to_string()))?;
            let material = if entry.role == SlotRole::AesKey {
                KeyMaterial::Aes(key)
            } else {
                KeyMaterial::EccP256(key)
            };
            se.install_key_protected(&authority, update.target, material)?;
        }
        _ => {
            let mut offset = 0;
            for chunk in &update.chunks {
                se.write_protected(&authority, update.target, offset, chunk)?;
                offset += chunk.len();
            }
        }
    }

    se.record_version_protected(&authority, update.target, version)?;
    audit::log_version_recorded(update.target.0, update.version);
    Ok(())
}

impl SecureDevice {
    /// Version of the last protected update applied to `slot`; zero if none.
    pub fn update_version(&self, slot: KeySlot) -> Result<u32, SeError> {
        Ok(self.session()?.read_version(slot)? as u32)
    }
}

/// Drives [`transition`] against a device and a transport.
pub struct UpdateWorkflow<'d, T: Transport> {
    device: &'d SecureDevice,
    transport: T,
    channels: Channels,
    state: UpdateState,
    sleeper: Sleeper,
    correlation_id: String,
    last_target: Option<(KeySlot, u32)>,
    last_fragments: usize,
}

impl<'d, T: Transport> UpdateWorkflow<'d, T> {
    pub fn new(device: &'d SecureDevice, transport: T) -> Result<Self, SeError> {
        let channels = Channels::for_identity(device.identity()?);
        Ok(Self {
            device,
            transport,
            channels,
            state: UpdateState::Idle,
            sleeper: thread_sleeper(),
            correlation_id: audit::new_correlation_id(),
            last_target: None,
            last_fragments: 0,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn budget(&self) -> RetryBudget {
        let config = self.device.config();
        RetryBudget {
            transport_attempts: config.csr.max_attempts,
            hardware_attempts: 1,
            wait_attempts: config.protected_update.wait_attempts,
        }
    }

    fn begin(&mut self, event: UpdateEvent) -> Result<(), SeError> {
        self.device.session().map(drop)?;
        self.correlation_id = audit::new_correlation_id();
        self.last_target = None;
        self.last_fragments = 0;
        let state = std::mem::replace(&mut self.state, UpdateState::Idle);
        self.state = transition(state, event);
        Ok(())
    }

    /// Wait for an update package on the `protected_update` channel.
    pub fn start(&mut self) -> Result<(), SeError> {
        let budget = self.budget();
        self.begin(UpdateEvent::Start(budget))
    }

    /// Wait for a bootstrap bundle on the `trust_anchor` channel.
    pub fn start_bootstrap(&mut self) -> Result<(), SeError> {
        let budget = self.budget();
        self.begin(UpdateEvent::StartBootstrap(budget))
    }

    /// Force `Idle`. Objects already written stay written.
    pub fn reset(&mut self) {
        let state = std::mem::replace(&mut self.state, UpdateState::Idle);
        self.state = transition(state, UpdateEvent::Reset);
    }

    /// Perform the current state's action and advance once.
    pub fn step(&mut self) -> Result<&UpdateState, SeError> {
        if self.state.is_terminal() {
            return Ok(&self.state);
        }

        let outcome = if self.device.is_licensed() {
            self.perform()
        } else {
            Err(SeError::NotLicensed)
        };

        let state = std::mem::replace(&mut self.state, UpdateState::Idle);
        let result = match outcome {
            Ok(event) => {
                self.state = transition(state, event);
                match &self.state {
                    UpdateState::Error(e) => Err(e.to_error()),
                    _ => Ok(()),
                }
            }
            Err(err) => {
                self.state = transition(state, UpdateEvent::Failed(WorkflowError::new(&err)));
                if matches!(self.state, UpdateState::Error(_)) {
                    Err(err)
                } else {
                    (self.sleeper)(self.device.config().csr.backoff());
                    Ok(())
                }
            }
        };

        if self.state.is_terminal() {
            self.finish();
        }
        result.map(|_| &self.state)
    }

    /// Start (or bootstrap) and step until `Complete` or `Error`.
    pub fn run(&mut self, bootstrap: bool) -> Result<(KeySlot, u32), SeError> {
        if bootstrap {
            self.start_bootstrap()?;
        } else {
            self.start()?;
        }
        loop {
            self.step()?;
            if let UpdateState::Complete { target, version } = self.state {
                return Ok((target, version));
            }
        }
    }

    fn perform(&mut self) -> Result<UpdateEvent, SeError> {
        match &self.state {
            UpdateState::WaitManifest { .. } => {
                let timeout = self.device.config().protected_update.manifest_timeout();
                if !self.transport.is_connected() {
                    self.transport.connect()?;
                }
                match self.transport.receive(&self.channels.protected_update, timeout)? {
                    Some(bytes) => Ok(UpdateEvent::PackageReceived(UpdatePackage::from_cbor(&bytes)?)),
                    None => Ok(UpdateEvent::WaitExpired),
                }
            }
            UpdateState::WaitJsonBundle { .. } => {
                let timeout = self.device.config().protected_update.manifest_timeout();
                if !self.transport.is_connected() {
                    self.transport.connect()?;
                }
                match self.transport.receive(&self.channels.trust_anchor, timeout)? {
                    Some(bytes) => Ok(UpdateEvent::BundleReceived(bytes)),
                    None => Ok(UpdateEvent::WaitExpired),
                }
            }
            UpdateState::ProcessJsonBundle { bundle } => {
                let bundle = JsonBundle::parse(bundle)?;
                trust_anchor_key(&bundle.signing_certificate)?;
                Ok(UpdateEvent::BundleParsed(bundle))
            }
            UpdateState::WriteTrustAnchor { bundle } => {
                let mut se = self.device.session()?;
                let existing = se.read_vec(KeySlot::TRUST_ANCHOR)?;
                if existing.is_empty() {
                    se.write(KeySlot::TRUST_ANCHOR, &bundle.signing_certificate)?;
                    drop(se);
                    let fingerprint = hex::encode(Sha256::digest(&bundle.signing_certificate));
                    audit::log_certificate_installed(KeySlot::TRUST_ANCHOR.0, "trust-anchor", &fingerprint);
                } else if existing != bundle.signing_certificate {
                    return Err(SeError::SignatureInvalid(
                        "bundle signer does not match the provisioned trust anchor".to_string(),
                    ));
                }
                Ok(UpdateEvent::TrustAnchorWritten)
            }
            UpdateState::VerifyManifest { package } => {
                let mut se = self.device.session()?;
                let update = verify_package(&mut se, package)?;
                self.last_target = Some((update.target, update.version));
                self.last_fragments = update.fragments;
                Ok(UpdateEvent::ManifestVerified(update))
            }
            UpdateState::ApplyFragments { update } => {
                let mut se = self.device.session()?;
                apply_update(&mut se, update)?;
                Ok(UpdateEvent::Applied)
            }
            UpdateState::Idle | UpdateState::Complete { .. } | UpdateState::Error(_) => Err(
                SeError::Internal(format!("no action in state {}", self.state.name())),
            ),
        }
    }

    /// Report the outcome of a finished round.
    fn finish(&mut self) {
        let ack = match &self.state {
            UpdateState::Complete { target, version } => {
                audit::log_update_applied(
                    &self.correlation_id,
                    target.0,
                    *version,
                    self.last_fragments,
                );
                UpdateAck {
                    status: "complete",
                    target: Some(target.0),
                    version: Some(*version),
                    code: 0,
                    detail: String::new(),
                }
            }
            UpdateState::Error(e) => {
                audit::log_update_rejected(&self.correlation_id, &e.kind.to_string(), &e.detail);
                UpdateAck {
                    status: "error",
                    target: self.last_target.map(|(slot, _)| slot.0),
                    version: self.last_target.map(|(_, version)| version),
                    code: e.code,
                    detail: e.detail.clone(),
                }
            }
            _ => return,
        };

        if !self.transport.is_connected() {
            return;
        }
        let published = serde_json::to_vec(&ack)
            .map_err(SeError::from)
            .and_then(|payload| self.transport.publish(&self.channels.ack, &payload));
        if let Err(e) = published {
            log::warn!("Failed to publish update acknowledgement: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::*;
    use crate::transport::LoopbackTransport;
    use p256::ecdsa::SigningKey;
    use p256::elliptic_curve::rand_core::OsRng;
    use p256::pkcs8::EncodePublicKey;

    fn budget() -> RetryBudget {
        RetryBudget {
            transport_attempts: 2,
            hardware_attempts: 1,
            wait_attempts: 1,
        }
    }

    fn provision_anchor(device: &SecureDevice, issuer: &SigningKey) {
        let spki = issuer.verifying_key().to_public_key_der().unwrap();
        device
            .session()
            .unwrap()
            .write(KeySlot::TRUST_ANCHOR, spki.as_bytes())
            .unwrap();
    }

    fn workflow(device: &SecureDevice) -> (UpdateWorkflow<'_, LoopbackTransport>, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        let wf = UpdateWorkflow::new(device, transport.clone())
            .unwrap()
            .with_sleeper(Box::new(|_| {}));
        (wf, transport)
    }

    #[test]
    fn test_transitions() {
        let s = transition(UpdateState::Idle, UpdateEvent::Start(budget()));
        assert_eq!(s.name(), "wait_manifest");
        let s = transition(s, UpdateEvent::WaitExpired);
        assert!(matches!(s, UpdateState::Error(ref e) if e.kind == ErrorKind::Timeout));

        let s = transition(UpdateState::Idle, UpdateEvent::StartBootstrap(budget()));
        assert_eq!(s.name(), "wait_json_bundle");
        let s = transition(s, UpdateEvent::Failed(WorkflowError::new(&SeError::Transport("x".into()))));
        assert!(matches!(s, UpdateState::WaitJsonBundle { attempt: 1, .. }));
        let s = transition(s, UpdateEvent::BundleReceived(vec![1]));
        assert_eq!(s.name(), "process_json_bundle");
        assert_eq!(transition(s.clone(), UpdateEvent::Start(budget())), s);
        assert!(matches!(
            transition(s, UpdateEvent::Applied),
            UpdateState::Error(ref e) if e.kind == ErrorKind::Internal
        ));
    }

    #[test]
    fn test_verify_failure_is_final() {
        let package = UpdatePackage {
            manifest: Default::default(),
            fragments: vec![],
        };
        let s = UpdateState::VerifyManifest { package };
        let e = WorkflowError::new(&SeError::SignatureInvalid("bad".into()));
        assert!(matches!(transition(s, UpdateEvent::Failed(e)), UpdateState::Error(_)));
    }

    #[test]
    fn test_update_applies_and_acks() {
        let (device, _) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let payload = vec![0xC4; 1500];
        let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 3, PayloadType::Cert, payload[..1100].to_vec())
            .fragment_size(400)
            .build(&issuer)
            .unwrap();

        let (mut wf, transport) = workflow(&device);
        transport
            .push(&wf.channels().protected_update.clone(), package.to_cbor().unwrap())
            .unwrap();
        assert_eq!(wf.run(false).unwrap(), (KeySlot::CA_CHAIN, 3));

        let mut se = device.session().unwrap();
        assert_eq!(se.read_vec(KeySlot::CA_CHAIN).unwrap(), payload[..1100].to_vec());
        assert_eq!(se.read_version(KeySlot::CA_CHAIN).unwrap(), 3);
        assert_eq!(se.read_version(KeySlot::DEVICE_CERT).unwrap(), 0);
        drop(se);

        let acks = transport.published(&wf.channels().ack).unwrap();
        let ack: serde_json::Value = serde_json::from_slice(&acks[0]).unwrap();
        assert_eq!(ack["status"], "complete");
        assert_eq!(ack["target"], KeySlot::CA_CHAIN.0);
        assert_eq!(ack["version"], 3);
    }

    #[test]
    fn test_unsigned_update_rejected_without_writes() {
        let (device, probe) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let forger = SigningKey::random(&mut OsRng);
        let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Cert, vec![1; 32])
            .build(&forger)
            .unwrap();

        let (mut wf, transport) = workflow(&device);
        transport
            .push(&wf.channels().protected_update.clone(), package.to_cbor().unwrap())
            .unwrap();
        let writes = probe.writes();
        assert!(matches!(wf.run(false), Err(SeError::SignatureInvalid(_))));
        assert_eq!(probe.writes(), writes);

        let acks = transport.published(&wf.channels().ack).unwrap();
        let ack: serde_json::Value = serde_json::from_slice(&acks[0]).unwrap();
        assert_eq!(ack["status"], "error");
        assert_eq!(ack["code"], -109);
    }

    #[test]
    fn test_metadata_and_mismatched_targets() {
        let (device, _) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let cases = [
            (KeySlot::CA_CHAIN, PayloadType::Metadata),
            (KeySlot::DEVICE_CERT, PayloadType::Key),
            (KeySlot(0), PayloadType::Data),
        ];
        for (slot, payload_type) in cases {
            let package = ManifestBuilder::new(slot, 1, payload_type, vec![7; 32])
                .build(&issuer)
                .unwrap();
            let mut se = device.session().unwrap();
            assert!(matches!(
                verify_package(&mut se, &package),
                Err(SeError::InvalidParam(_))
            ));
        }
    }

    #[test]
    fn test_key_update_installs_session_key() {
        let (device, _) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let app_key = SigningKey::random(&mut OsRng);
        let package = ManifestBuilder::new(KeySlot::APP_KEY, 1, PayloadType::Key, app_key.to_bytes().to_vec())
            .build(&issuer)
            .unwrap();
        let update = {
            let mut se = device.session().unwrap();
            verify_package(&mut se, &package).unwrap()
        };
        let mut se = device.session().unwrap();
        apply_update(&mut se, &update).unwrap();
        assert_eq!(se.public_key(KeySlot::APP_KEY).unwrap(), *app_key.verifying_key());
        assert_eq!(se.read_version(KeySlot::APP_KEY).unwrap(), 1);
    }

    #[test]
    fn test_version_beyond_tag_range_rejected_before_writes() {
        let (device, probe) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        for version in [MAX_OBJECT_VERSION as u32 + 1, 600_010, u32::MAX] {
            let package = ManifestBuilder::new(KeySlot::CA_CHAIN, version, PayloadType::Cert, vec![0xAB; 4])
                .build(&issuer)
                .unwrap();
            let writes = probe.writes();
            let mut se = device.session().unwrap();
            assert!(matches!(
                verify_package(&mut se, &package),
                Err(SeError::InvalidParam(_))
            ));
            assert_eq!(probe.writes(), writes);
            assert!(se.read_vec(KeySlot::CA_CHAIN).unwrap().is_empty());
            assert_eq!(se.read_version(KeySlot::CA_CHAIN).unwrap(), 0);
        }

        let top = ManifestBuilder::new(KeySlot::CA_CHAIN, MAX_OBJECT_VERSION as u32, PayloadType::Cert, vec![1; 4])
            .build(&issuer)
            .unwrap();
        let mut se = device.session().unwrap();
        let update = verify_package(&mut se, &top).unwrap();
        apply_update(&mut se, &update).unwrap();
        assert_eq!(se.read_version(KeySlot::CA_CHAIN).unwrap(), MAX_OBJECT_VERSION);
    }

    #[test]
    fn test_apply_rechecks_version_under_its_own_guard() {
        let (device, probe) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let older = ManifestBuilder::new(KeySlot::CA_CHAIN, 3, PayloadType::Cert, vec![3; 16])
            .build(&issuer)
            .unwrap();
        let newer = ManifestBuilder::new(KeySlot::CA_CHAIN, 5, PayloadType::Cert, vec![5; 16])
            .build(&issuer)
            .unwrap();
        let stale = verify_package(&mut device.session().unwrap(), &older).unwrap();

        // another round lands between verification and apply
        let mut se = device.session().unwrap();
        let update = verify_package(&mut se, &newer).unwrap();
        apply_update(&mut se, &update).unwrap();

        let writes = probe.writes();
        assert!(matches!(
            apply_update(&mut se, &stale),
            Err(SeError::VersionStale { current: 5, offered: 3 })
        ));
        assert_eq!(probe.writes(), writes);
        assert_eq!(se.read_vec(KeySlot::CA_CHAIN).unwrap(), vec![5; 16]);
    }

    #[test]
    fn test_apply_records_version_in_one_write() {
        let (device, probe) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        provision_anchor(&device, &issuer);

        let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 30_000, PayloadType::Cert, vec![2; 100])
            .build(&issuer)
            .unwrap();
        let mut se = device.session().unwrap();
        let update = verify_package(&mut se, &package).unwrap();
        let writes = probe.writes();
        apply_update(&mut se, &update).unwrap();
        // one fragment plus the version tag
        assert_eq!(probe.writes(), writes + 2);
        assert_eq!(se.read_version(KeySlot::CA_CHAIN).unwrap(), 30_000);
    }

    #[test]
    fn test_missing_trust_anchor() {
        let (device, _) = licensed_device();
        let issuer = SigningKey::random(&mut OsRng);
        let package = ManifestBuilder::new(KeySlot::CA_CHAIN, 1, PayloadType::Cert, vec![1; 8])
            .build(&issuer)
            .unwrap();
        let mut se = device.session().unwrap();
        assert!(matches!(
            verify_package(&mut se, &package),
            Err(SeError::Certificate(_))
        ));
    }

    #[test]
    fn test_gated() {
        let (device, _) = unlicensed_device();
        let (mut wf, _) = workflow(&device);
        assert!(matches!(wf.start(), Err(SeError::NotLicensed)));
        assert_eq!(wf.state(), &UpdateState::Idle);
    }
}
