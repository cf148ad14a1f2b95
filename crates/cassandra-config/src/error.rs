//! Error types for the configuration manager.

use cassandra_state::StoreError;
use thiserror::Error;

use crate::manager::ManagerPhase;
use crate::records::RecordKey;

/// Result type alias for configuration manager operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// An accessor or update was called outside the `Ready` phase.
    #[error("configuration manager is not ready (phase {phase})")]
    NotReady { phase: ManagerPhase },

    /// The manager hit an unrecoverable condition and refuses all work.
    #[error("configuration manager failed: {0}")]
    Failed(String),

    /// A persisted record does not decode. Needs operator repair.
    #[error("malformed {key} record: {reason}")]
    MalformedRecord { key: RecordKey, reason: String },

    /// Another writer changed the record since this instance last read it.
    #[error("record {key} was modified concurrently")]
    ConcurrentModification { key: String },

    #[error("another configuration update is in progress")]
    UpdateInProgress,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("inconsistent record set: {0}")]
    Inconsistent(String),

    #[error("cannot {op} in phase {phase}")]
    IllegalTransition { op: &'static str, phase: ManagerPhase },

    #[error(transparent)]
    Store(#[from] StoreError),
}
