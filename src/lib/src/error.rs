use crate::slots::{KeySlot, ObjectId};

/// Broad classification of a [`SeError`].
///
/// Callers use the kind to decide on retry policy. Hardware and transport
/// faults get bounded automatic retry; a [`ErrorKind::Timeout`] only allows a
/// bounded re-entry of the wait state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotLicensed,
    NotInitialized,
    HardwareError,
    InvalidParam,
    ReservedSlot,
    SizeExceeded,
    SignatureInvalid,
    VersionStale,
    Timeout,
    Transport,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotLicensed => "not_licensed",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::HardwareError => "hardware_error",
            ErrorKind::InvalidParam => "invalid_param",
            ErrorKind::ReservedSlot => "reserved_slot",
            ErrorKind::SizeExceeded => "size_exceeded",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::VersionStale => "version_stale",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// The seid error type.
#[derive(Debug, thiserror::Error)]
pub enum SeError {
    #[error("Not licensed")]
    NotLicensed,

    #[error("Not initialized")]
    NotInitialized,

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Slot {0} is reserved for protected updates")]
    ReservedSlot(KeySlot),

    #[error("Slot {slot} holds at most {capacity} bytes, got {len}")]
    SizeExceeded {
        slot: KeySlot,
        capacity: usize,
        len: usize,
    },

    #[error("Object {0} is locked")]
    SlotLocked(ObjectId),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Stale version {offered} (counter is at {current})")]
    VersionStale { current: u32, offered: u32 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Time error: {0}")]
    TimeError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("Internal error: [{0}]")]
    Internal(String),
}

impl SeError {
    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SeError::NotLicensed => ErrorKind::NotLicensed,
            SeError::NotInitialized => ErrorKind::NotInitialized,
            SeError::HardwareError(_) | SeError::KeyNotFound(_) => ErrorKind::HardwareError,
            SeError::InvalidParam(_) | SeError::Parse(_) | SeError::Certificate(_) => {
                ErrorKind::InvalidParam
            }
            SeError::ReservedSlot(_) | SeError::SlotLocked(_) => ErrorKind::ReservedSlot,
            SeError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            SeError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            SeError::VersionStale { .. } => ErrorKind::VersionStale,
            SeError::Timeout(_) => ErrorKind::Timeout,
            SeError::Transport(_) => ErrorKind::Transport,
            SeError::TimeError(_) | SeError::IOError(_) | SeError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Numeric status code reported alongside terminal workflow errors.
    pub fn status_code(&self) -> i32 {
        match self {
            SeError::NotLicensed => -100,
            SeError::NotInitialized => -101,
            SeError::InvalidParam(_) => -102,
            SeError::Timeout(_) => -103,
            SeError::HardwareError(_) => -104,
            SeError::KeyNotFound(_) => -105,
            SeError::ReservedSlot(_) => -106,
            SeError::SizeExceeded { .. } => -107,
            SeError::SlotLocked(_) => -108,
            SeError::SignatureInvalid(_) => -109,
            SeError::VersionStale { .. } => -110,
            SeError::Certificate(_) => -111,
            SeError::Transport(_) => -112,
            SeError::Parse(_) => -113,
            SeError::TimeError(_) => -114,
            SeError::IOError(_) => -115,
            SeError::Internal(_) => -116,
        }
    }

    /// Whether a workflow may retry the failed step after a delay.
    ///
    /// Hardware faults and transport faults are transient. Everything else is
    /// either a caller bug or a security decision and must reach the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeError::HardwareError(_) | SeError::Transport(_)
        )
    }
}

impl From<x509_parser::error::X509Error> for SeError {
    fn from(err: x509_parser::error::X509Error) -> Self {
        SeError::Certificate(format!("{:?}", err))
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for SeError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        SeError::Certificate(format!("{}", err))
    }
}

impl From<p256::ecdsa::Error> for SeError {
    fn from(err: p256::ecdsa::Error) -> Self {
        SeError::SignatureInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for SeError {
    fn from(err: serde_json::Error) -> Self {
        SeError::Parse(err.to_string())
    }
}

impl From<serde_cbor::Error> for SeError {
    fn from(err: serde_cbor::Error) -> Self {
        SeError::Parse(err.to_string())
    }
}

impl From<base64::DecodeError> for SeError {
    fn from(err: base64::DecodeError) -> Self {
        SeError::Parse(format!("base64: {}", err))
    }
}
