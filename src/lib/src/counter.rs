//! Monotonic counters
//!
//! Four hardware counters, each with a fixed role:
//!
//! | Id | Role |
//! |----|------|
//! | 0 | message sequence |
//! | 1 | update / firmware version |
//! | 2 | usage |
//! | 3 | security events |
//!
//! Counters only move forward. Each has a write budget of roughly 600,000
//! increments, so callers should advance them sparingly. Protected updates
//! do not spend them: their anti-rollback version is a tag in the metadata of
//! each target object.

use crate::audit;
use crate::device::SecureDevice;
use crate::error::SeError;
use crate::platform::CounterValue;
use crate::slots::CounterId;

impl SecureDevice {
    /// Current value and threshold of a counter.
    pub fn counter_read(&self, id: CounterId) -> Result<CounterValue, SeError> {
        self.session()?.read_counter(id)
    }

    /// Advance a counter by `step` (1..=255).
    pub fn counter_increment(&self, id: CounterId, step: u8) -> Result<CounterValue, SeError> {
        let value = self.session()?.increment_counter(id, step)?;
        if value.remaining() < 1000 {
            log::warn!(
                "Counter {} has {} increments left before its threshold",
                id,
                value.remaining()
            );
        }
        audit::log_counter_advanced(id.index(), value.value, step);
        Ok(value)
    }
}
