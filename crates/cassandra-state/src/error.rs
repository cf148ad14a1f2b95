//! Error types for the versioned record store.

use std::time::Duration;

use thiserror::Error;

use crate::record::{CasFailure, ExpectedVersion, Version};

/// Result type alias for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the record store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// No server answered within the connection timeout. Fatal at startup.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A backend could not reach any server for this call.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// Contact was lost mid-operation inside a live session; the operation
    /// may or may not have been applied.
    #[error("connection lost during {op}; outcome unknown")]
    ConnectionLoss { op: &'static str },

    /// The session outlived its timeout without contact. State must be
    /// re-read from the store after reconnecting.
    #[error("store session expired")]
    SessionExpired,

    #[error("store session closed")]
    SessionClosed,

    /// The operation did not finish in time; it may still have committed.
    #[error("{op} timed out after {after:?}; outcome unknown")]
    Timeout { op: &'static str, after: Duration },

    #[error("version conflict on {key}: expected {expected}, found {}", display_version(.actual))]
    VersionConflict {
        key: String,
        expected: ExpectedVersion,
        actual: Option<Version>,
    },

    #[error("record {key} already exists at version {version}")]
    AlreadyExists { key: String, version: Version },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record key {0:?}")]
    InvalidKey(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

fn display_version(version: &Option<Version>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "no record".to_string(),
    }
}

impl StoreError {
    /// Whether the failure leaves the outcome of a write unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::ConnectionLoss { .. }
        )
    }
}

impl From<CasFailure> for StoreError {
    fn from(failure: CasFailure) -> Self {
        match failure {
            CasFailure::Conflict {
                key,
                expected,
                actual,
            } => StoreError::VersionConflict {
                key,
                expected,
                actual,
            },
            CasFailure::AlreadyExists { key, version } => {
                StoreError::AlreadyExists { key, version }
            }
            CasFailure::NotFound { key } => StoreError::NotFound(key),
        }
    }
}
