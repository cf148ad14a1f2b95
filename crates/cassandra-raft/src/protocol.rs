//! Client-facing wire types of a store node.

use std::collections::BTreeSet;

use cassandra_state::{CasFailure, StoreOp, Version, VersionedRecord};
use serde::{Deserialize, Serialize};

pub const PING_PATH: &str = "/store/ping";
pub const READ_PATH: &str = "/store/read";
pub const APPLY_PATH: &str = "/store/apply";
pub const ADD_LEARNER_PATH: &str = "/cluster/add-learner";
pub const CHANGE_MEMBERSHIP_PATH: &str = "/cluster/change-membership";

/// Answer of a store node to a client call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientReply<T> {
    Ok(T),
    /// Only the leader serves this call. `leader` is its address if known.
    Redirect { leader: Option<String> },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub ops: Vec<StoreOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLearnerRequest {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMembershipRequest {
    pub add_voters: BTreeSet<u64>,
}

pub type PingReply = ClientReply<()>;
pub type ReadReply = ClientReply<Option<VersionedRecord>>;
pub type ApplyReply = ClientReply<Result<Vec<Version>, CasFailure>>;
pub type MembershipReply = ClientReply<()>;
