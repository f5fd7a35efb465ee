//! Error taxonomy
//!
//! Every failure mode in the daemon maps to one of these variants.
//! The rule throughout: sensor and reasoning faults degrade to a safe
//! default and are logged; only persistence failures abort the current
//! cycle or consolidation stage.

use std::time::Duration;

/// Daemon-wide error type
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Sensor body exceeded its per-invocation timeout
    #[error("sensor '{name}' timed out after {timeout:?}")]
    SensorTimeout { name: String, timeout: Duration },

    /// Sensor body returned an error
    #[error("sensor '{name}' failed: {reason}")]
    SensorFault { name: String, reason: String },

    /// Required config keys absent at startup; sensor force-disabled
    #[error("sensor '{name}' missing config keys: {missing:?}")]
    ConfigMissing { name: String, missing: Vec<String> },

    /// Reasoning output was not a well-formed decision/extraction
    #[error("reasoning protocol violation: {0}")]
    ProtocolViolation(String),

    /// Reasoning call exceeded its timeout
    #[error("reasoning call timed out after {0:?}")]
    ReasoningTimeout(Duration),

    /// Reasoning service unreachable or returned an error status
    #[error("reasoning service unavailable: {0}")]
    ReasoningUnavailable(String),

    /// Transport delivery failed; retried naturally next cycle
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// Durable store error; fatal for the affected operation only
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl CompanionError {
    /// Whether this error should abort the operation that hit it
    /// (everything else degrades to a logged no-op).
    pub fn is_fatal_for_operation(&self) -> bool {
        matches!(self, CompanionError::Persistence(_))
    }
}
