//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Runtime job failures are not errors of
//! this kind; they travel as [`Failure`](crate::kernel::escalation::Failure)
//! through the escalation procedure.

use thiserror::Error;

use crate::kernel::list::ListError;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the office kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors, detected once before any job runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Validation errors on kernel API input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown flow, process or slot.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition (starting twice, invoking a terminated process).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Ownership list misuse.
    #[error("list error: {0}")]
    List(#[from] ListError),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error was raised while building metadata.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}
