//! Error types for record validation and serialization.

use thiserror::Error;

/// Result type alias for validation checks.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Result type alias for record serializers.
pub type SerializationResult<T> = Result<T, SerializationError>;

/// A record value that violates one of its invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors produced by a record serializer.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The bytes do not decode to a valid value. Never partially recovered.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The value handed to the encoder breaks an invariant.
    #[error("refusing to encode invalid value: {0}")]
    Invalid(#[from] ValidationError),

    #[error("encode error: {0}")]
    Encode(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
