//! Shared pieces of the CSR and protected-update state machines.

use crate::error::{ErrorKind, SeError};
use std::fmt;
use std::time::Duration;

/// Failure recorded in a terminal `Error` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowError {
    /// Numeric status code, see [`SeError::status_code`]
    pub code: i32,
    pub kind: ErrorKind,
    pub detail: String,
    /// Whether the failed step may be attempted again
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(err: &SeError) -> Self {
        Self {
            code: err.status_code(),
            kind: err.kind(),
            detail: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    /// Failure caused by an event that makes no sense in the current state.
    pub fn unexpected(state: &str, event: &str) -> Self {
        Self::new(&SeError::Internal(format!(
            "event {} not valid in state {}",
            event, state
        )))
    }

    /// Rebuild an error of the same kind carrying the recorded detail.
    pub fn to_error(&self) -> SeError {
        let detail = self.detail.clone();
        match self.kind {
            ErrorKind::NotLicensed => SeError::NotLicensed,
            ErrorKind::NotInitialized => SeError::NotInitialized,
            ErrorKind::HardwareError => SeError::HardwareError(detail),
            ErrorKind::InvalidParam => SeError::InvalidParam(detail),
            ErrorKind::SignatureInvalid => SeError::SignatureInvalid(detail),
            ErrorKind::Timeout => SeError::Timeout(detail),
            ErrorKind::Transport => SeError::Transport(detail),
            ErrorKind::ReservedSlot
            | ErrorKind::SizeExceeded
            | ErrorKind::VersionStale
            | ErrorKind::Internal => SeError::Internal(detail),
        }
    }
}

impl From<&SeError> for WorkflowError {
    fn from(err: &SeError) -> Self {
        WorkflowError::new(err)
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code, self.detail)
    }
}

/// Attempt limits fixed when a workflow starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Connect/publish attempts
    pub transport_attempts: u32,
    /// Attempts per hardware step
    pub hardware_attempts: u32,
    /// Waits per wait state before a timeout becomes fatal
    pub wait_attempts: u32,
}

impl RetryBudget {
    /// `attempt` is zero-based; true when one more try is allowed.
    pub fn allows_transport_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.transport_attempts
    }

    pub fn allows_hardware_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.hardware_attempts
    }

    pub fn allows_another_wait(&self, waits: u32) -> bool {
        waits + 1 < self.wait_attempts
    }
}

/// Delay function used between retries.
pub type Sleeper = Box<dyn FnMut(Duration) + Send>;

pub fn thread_sleeper() -> Sleeper {
    Box::new(std::thread::sleep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::KeySlot;

    #[test]
    fn test_workflow_error_from_se_error() {
        let err = WorkflowError::from(&SeError::ReservedSlot(KeySlot(4)));
        assert_eq!(err.code, -106);
        assert_eq!(err.kind, ErrorKind::ReservedSlot);
        assert!(!err.retryable);
        assert!(err.to_string().contains("Slot 4 is reserved"));

        let hw = WorkflowError::from(&SeError::HardwareError("bus".to_string()));
        assert!(hw.retryable);
        assert!(matches!(hw.to_error(), SeError::HardwareError(_)));

        let timeout = WorkflowError::new(&SeError::Timeout("no reply".to_string()));
        assert_eq!(timeout.to_error().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_budget() {
        let budget = RetryBudget {
            transport_attempts: 3,
            hardware_attempts: 1,
            wait_attempts: 1,
        };
        assert!(budget.allows_transport_retry(0));
        assert!(budget.allows_transport_retry(1));
        assert!(!budget.allows_transport_retry(2));
        assert!(!budget.allows_hardware_retry(0));
        assert!(!budget.allows_another_wait(0));
    }
}
