//! Runtime errors
//!
//! User faults travel as `Value`s through the active contract; the
//! variants here are the protocol and wiring failures that must stay
//! deterministic rather than corrupt frame state.

use crate::value::Value;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("frame resumed after reaching a terminal state")]
    ResumedAfterCompletion,

    #[error("uncaught fault: {0}")]
    UncaughtFault(Value),

    #[error("cleanup fault during abandonment: {0}")]
    CleanupFault(Value),

    #[error("host function `{name}` is not registered")]
    MissingHostFunction { name: String },

    #[error("function `{function}` does not drive the {expected} contract")]
    ContractMismatch {
        function: String,
        expected: &'static str,
    },

    #[error("malformed step body: {message}")]
    Malformed { message: String },
}

impl RuntimeError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        RuntimeError::Malformed {
            message: message.into(),
        }
    }
}
