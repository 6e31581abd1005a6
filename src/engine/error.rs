use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::holds::StoreError;
use crate::ledger::LedgerError;

/// One rejected request field. `field` uses the wire (camelCase) name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join(errors: &[FieldError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum ReservationError {
    /// Malformed input. Never retried automatically.
    #[error("invalid claim: {}", join(.0))]
    Invalid(Vec<FieldError>),

    /// The store did not answer in time. The hold may or may not have been
    /// written; retrying the identical claim is safe.
    #[error("claim on slot {slot_id} timed out after {timeout:?}, outcome unknown")]
    OutcomeUnknown { slot_id: String, timeout: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ReservationError {
    /// Whether the caller may retry the identical request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReservationError::Invalid(_))
    }
}
