//! Raft type configuration for the record store.
//!
//! Defines the `TypeConfig` that wires together all openraft
//! associated types, plus the command and reply carried through the log.

use std::io::Cursor;

use cassandra_state::{CasFailure, StoreOp, Version};
use openraft::TokioRuntime;

/// Client write request submitted to the Raft cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Request {
    /// Apply a CAS batch atomically.
    Apply { ops: Vec<StoreOp> },
}

/// Verdict of the state machine on one request.
///
/// A rejected batch is still a committed log entry; every replica records
/// the same rejection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub outcome: Result<Vec<Version>, CasFailure>,
}

impl Response {
    pub fn empty() -> Self {
        Self {
            outcome: Ok(Vec::new()),
        }
    }
}

openraft::declare_raft_types!(
    /// Record store Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type RecordRaft = openraft::Raft<TypeConfig>;
