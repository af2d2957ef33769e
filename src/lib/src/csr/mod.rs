//! Device certificate bootstrap
//!
//! The CSR workflow provisions the device certificate:
//!
//! ```text
//! Idle → GenerateKeypair → GenerateCsr → Connect → PublishCsr
//!      → WaitCertificate → ValidateCertificate → WriteCertificate → Done
//! ```
//!
//! Any step may end in `Error`. The state machine itself is the pure
//! [`transition`] function; [`CsrWorkflow`] performs the side effect of the
//! current state and feeds the outcome back in as an event.
//!
//! Transport steps are retried with a fixed backoff up to `max_attempts`.
//! Hardware steps get `hardware_retries` attempts. Certificate validation
//! failures are final. Starting again from `Done` rotates the identity key
//! and certificate.

pub mod request;
pub mod validate;

pub use request::{CertificateRequest, MAX_CSR_LEN};
pub use validate::{certificate_der, validate_certificate, ValidatedCertificate, MAX_CERTIFICATE_LEN};

use crate::audit;
use crate::config::CsrConfig;
use crate::device::SecureDevice;
use crate::error::{ErrorKind, SeError};
use crate::platform::VerifyingKey;
use crate::slots::KeySlot;
use crate::transport::{Channels, Transport};
use crate::workflow::{thread_sleeper, RetryBudget, Sleeper, WorkflowError};

/// A CSR waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub public_key: VerifyingKey,
    pub pem: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CsrState {
    Idle,
    GenerateKeypair {
        budget: RetryBudget,
        attempt: u32,
    },
    GenerateCsr {
        budget: RetryBudget,
        public_key: VerifyingKey,
        attempt: u32,
    },
    Connect {
        budget: RetryBudget,
        request: PendingRequest,
        attempt: u32,
    },
    PublishCsr {
        budget: RetryBudget,
        request: PendingRequest,
        attempt: u32,
    },
    WaitCertificate {
        budget: RetryBudget,
        public_key: VerifyingKey,
        waits: u32,
    },
    ValidateCertificate {
        budget: RetryBudget,
        public_key: VerifyingKey,
        certificate: Vec<u8>,
    },
    WriteCertificate {
        budget: RetryBudget,
        certificate: ValidatedCertificate,
        attempt: u32,
    },
    Done {
        certificate: ValidatedCertificate,
    },
    Error(WorkflowError),
}

impl CsrState {
    pub fn name(&self) -> &'static str {
        match self {
            CsrState::Idle => "idle",
            CsrState::GenerateKeypair { .. } => "generate_keypair",
            CsrState::GenerateCsr { .. } => "generate_csr",
            CsrState::Connect { .. } => "connect",
            CsrState::PublishCsr { .. } => "publish_csr",
            CsrState::WaitCertificate { .. } => "wait_certificate",
            CsrState::ValidateCertificate { .. } => "validate_certificate",
            CsrState::WriteCertificate { .. } => "write_certificate",
            CsrState::Done { .. } => "done",
            CsrState::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CsrState::Idle | CsrState::Done { .. } | CsrState::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CsrEvent {
    Start(RetryBudget),
    KeypairGenerated(VerifyingKey),
    CsrBuilt(String),
    Connected,
    Published,
    CertificateReceived(Vec<u8>),
    WaitExpired,
    CertificateValidated(ValidatedCertificate),
    CertificateWritten,
    Failed(WorkflowError),
    Reset,
}

impl CsrEvent {
    fn name(&self) -> &'static str {
        match self {
            CsrEvent::Start(_) => "start",
            CsrEvent::KeypairGenerated(_) => "keypair_generated",
            CsrEvent::CsrBuilt(_) => "csr_built",
            CsrEvent::Connected => "connected",
            CsrEvent::Published => "published",
            CsrEvent::CertificateReceived(_) => "certificate_received",
            CsrEvent::WaitExpired => "wait_expired",
            CsrEvent::CertificateValidated(_) => "certificate_validated",
            CsrEvent::CertificateWritten => "certificate_written",
            CsrEvent::Failed(_) => "failed",
            CsrEvent::Reset => "reset",
        }
    }
}

fn hardware_retry(error: &WorkflowError, budget: &RetryBudget, attempt: u32) -> bool {
    error.retryable && error.kind == ErrorKind::HardwareError && budget.allows_hardware_retry(attempt)
}

/// The CSR state machine.
pub fn transition(state: CsrState, event: CsrEvent) -> CsrState {
    use CsrEvent as E;
    use CsrState as S;

    match (state, event) {
        (_, E::Reset) => S::Idle,

        (S::Idle | S::Done { .. } | S::Error(_), E::Start(budget)) => S::GenerateKeypair { budget, attempt: 0 },

        (S::GenerateKeypair { budget, .. }, E::KeypairGenerated(public_key)) => S::GenerateCsr {
            budget,
            public_key,
            attempt: 0,
        },
        (S::GenerateKeypair { budget, attempt }, E::Failed(e)) if hardware_retry(&e, &budget, attempt) => {
            S::GenerateKeypair {
                budget,
                attempt: attempt + 1,
            }
        }

        (S::GenerateCsr { budget, public_key, .. }, E::CsrBuilt(pem)) => S::Connect {
            budget,
            request: PendingRequest { public_key, pem },
            attempt: 0,
        },
        (S::GenerateCsr { budget, public_key, attempt }, E::Failed(e))
            if hardware_retry(&e, &budget, attempt) =>
        {
            S::GenerateCsr {
                budget,
                public_key,
                attempt: attempt + 1,
            }
        }

        (S::Connect { budget, request, attempt }, E::Connected) => S::PublishCsr {
            budget,
            request,
            attempt,
        },
        (S::PublishCsr { budget, request, .. }, E::Published) => S::WaitCertificate {
            budget,
            public_key: request.public_key,
            waits: 0,
        },
        (S::Connect { budget, request, attempt } | S::PublishCsr { budget, request, attempt }, E::Failed(e))
            if e.retryable && budget.allows_transport_retry(attempt) =>
        {
            S::Connect {
                budget,
                request,
                attempt: attempt + 1,
            }
        }

        (S::WaitCertificate { budget, public_key, .. }, E::CertificateReceived(certificate)) => {
            S::ValidateCertificate {
                budget,
                public_key,
                certificate,
            }
        }
        (S::WaitCertificate { budget, public_key, waits }, E::WaitExpired) => {
            if budget.allows_another_wait(waits) {
                S::WaitCertificate {
                    budget,
                    public_key,
                    waits: waits + 1,
                }
            } else {
                S::Error(WorkflowError::new(&SeError::Timeout(
                    "no certificate received".to_string(),
                )))
            }
        }

        (S::ValidateCertificate { budget, .. }, E::CertificateValidated(certificate)) => S::WriteCertificate {
            budget,
            certificate,
            attempt: 0,
        },

        (S::WriteCertificate { certificate, .. }, E::CertificateWritten) => S::Done { certificate },
        (S::WriteCertificate { budget, certificate, attempt }, E::Failed(e))
            if hardware_retry(&e, &budget, attempt) =>
        {
            S::WriteCertificate {
                budget,
                certificate,
                attempt: attempt + 1,
            }
        }

        (_, E::Failed(e)) => S::Error(e),
        (state, E::Start(_)) => state,
        (state, event) => S::Error(WorkflowError::unexpected(state.name(), event.name())),
    }
}

/// Drives [`transition`] against a device and a transport.
pub struct CsrWorkflow<'d, T: Transport> {
    device: &'d SecureDevice,
    transport: T,
    channels: Channels,
    config: CsrConfig,
    extra_issuers: Vec<Vec<u8>>,
    state: CsrState,
    sleeper: Sleeper,
}

impl<'d, T: Transport> CsrWorkflow<'d, T> {
    /// Create a workflow. The device must have been initialized.
    pub fn new(device: &'d SecureDevice, transport: T) -> Result<Self, SeError> {
        let channels = Channels::for_identity(device.identity()?);
        Ok(Self {
            device,
            transport,
            channels,
            config: device.config().csr.clone(),
            extra_issuers: Vec::new(),
            state: CsrState::Idle,
            sleeper: thread_sleeper(),
        })
    }

    /// Replace the delay used between retries.
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Trust an issuer certificate (DER) in addition to the CA chain slot.
    pub fn with_issuer(mut self, der: Vec<u8>) -> Self {
        self.extra_issuers.push(der);
        self
    }

    pub fn state(&self) -> &CsrState {
        &self.state
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Begin a round from `Idle`, `Done` or `Error`.
    pub fn start(&mut self) -> Result<(), SeError> {
        self.device.session().map(drop)?;
        let budget = RetryBudget {
            transport_attempts: self.config.max_attempts,
            hardware_attempts: self.config.hardware_retries,
            wait_attempts: self.config.wait_attempts,
        };
        let state = std::mem::replace(&mut self.state, CsrState::Idle);
        self.state = transition(state, CsrEvent::Start(budget));
        Ok(())
    }

    /// Force `Idle`. Anything already written stays written.
    pub fn reset(&mut self) {
        let state = std::mem::replace(&mut self.state, CsrState::Idle);
        self.state = transition(state, CsrEvent::Reset);
    }

    /// Perform the current state's action and advance once.
    pub fn step(&mut self) -> Result<&CsrState, SeError> {
        if self.state.is_terminal() {
            return Ok(&self.state);
        }

        let outcome = if self.device.is_licensed() {
            self.perform()
        } else {
            Err(SeError::NotLicensed)
        };

        let state = std::mem::replace(&mut self.state, CsrState::Idle);
        match outcome {
            Ok(event) => {
                self.state = transition(state, event);
                if let CsrState::Error(e) = &self.state {
                    return Err(e.to_error());
                }
            }
            Err(err) => {
                self.state = transition(state, CsrEvent::Failed(WorkflowError::new(&err)));
                if matches!(self.state, CsrState::Error(_)) {
                    return Err(err);
                }
                (self.sleeper)(self.config.backoff());
            }
        }
        Ok(&self.state)
    }

    /// Start and step until `Done` or `Error`.
    pub fn run(&mut self) -> Result<ValidatedCertificate, SeError> {
        self.start()?;
        loop {
            self.step()?;
            if let CsrState::Done { certificate } = &self.state {
                return Ok(certificate.clone());
            }
        }
    }

    fn perform(&mut self) -> Result<CsrEvent, SeError> {
        match &self.state {
            CsrState::GenerateKeypair { .. } => {
                let public_key = self.device.generate_keypair(KeySlot::IDENTITY_KEY)?;
                Ok(CsrEvent::KeypairGenerated(public_key))
            }
            CsrState::GenerateCsr { .. } => {
                let identity = self.device.identity()?;
                let mut se = self.device.session()?;
                let request = CertificateRequest::build(
                    &mut se,
                    KeySlot::IDENTITY_KEY,
                    identity,
                    self.config.organization.as_deref(),
                )?;
                Ok(CsrEvent::CsrBuilt(request.to_pem()))
            }
            CsrState::Connect { .. } => {
                if !self.transport.is_connected() {
                    self.transport.connect()?;
                }
                Ok(CsrEvent::Connected)
            }
            CsrState::PublishCsr { request, .. } => {
                self.transport
                    .publish(&self.channels.csr, request.pem.as_bytes())?;
                Ok(CsrEvent::Published)
            }
            CsrState::WaitCertificate { .. } => {
                match self
                    .transport
                    .receive(&self.channels.certificate, self.config.certificate_timeout())?
                {
                    Some(bytes) => Ok(CsrEvent::CertificateReceived(bytes)),
                    None => Ok(CsrEvent::WaitExpired),
                }
            }
            CsrState::ValidateCertificate {
                public_key,
                certificate,
                ..
            } => {
                let der = certificate_der(certificate)?;
                let mut issuers = self.known_issuers()?;
                issuers.extend(self.extra_issuers.iter().cloned());
                let time = self.device.time_source();
                let now = if crate::time::is_synced(time) {
                    time.now_unix().ok()
                } else {
                    None
                };
                let identity = self.device.identity()?;
                let validated =
                    validate_certificate(&der, &identity.common_name(), public_key, &issuers, now)?;
                Ok(CsrEvent::CertificateValidated(validated))
            }
            CsrState::WriteCertificate { certificate, .. } => {
                self.device
                    .session()?
                    .write(KeySlot::DEVICE_CERT, &certificate.der)?;
                audit::log_certificate_installed(
                    KeySlot::DEVICE_CERT.0,
                    &certificate.subject_cn,
                    &certificate.fingerprint,
                );
                Ok(CsrEvent::CertificateWritten)
            }
            CsrState::Idle | CsrState::Done { .. } | CsrState::Error(_) => Err(SeError::Internal(
                format!("no action in state {}", self.state.name()),
            )),
        }
    }

    /// Issuer certificates stored in the CA chain slot.
    fn known_issuers(&self) -> Result<Vec<Vec<u8>>, SeError> {
        let stored = self.device.session()?.read_vec(KeySlot::CA_CHAIN)?;
        validate::split_certificates(&stored)
    }
}
