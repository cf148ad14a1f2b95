// StorageError and the raft RPC errors are large; every storage result carries one.
#![allow(clippy::result_large_err)]

//! cassandra-raft — consensus-backed record store.
//!
//! Replicates the versioned record store across a small group of store
//! nodes with openraft, persisting the Raft log and the record tables in
//! redb. CAS batches are decided inside the state machine so every
//! replica agrees on which batches were rejected.
//!
//! # Architecture
//!
//! - **`typ`** — Type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`log_store`** — Raft log storage backed by redb
//! - **`state_machine`** — applies committed CAS batches to the record tables
//! - **`network`** / **`server`** — Raft RPCs and client calls as JSON over HTTP
//! - **`node`** — `StoreNode`, one member of the store cluster
//! - **`client`** — `ConsensusClient`, the `Backend` a scheduler session uses

pub mod client;
pub mod http;
pub mod log_store;
pub mod network;
pub mod node;
pub mod protocol;
pub mod server;
pub mod state_machine;
mod storage_err;
pub mod typ;

pub use client::{ConsensusClient, connect};
pub use log_store::LogStore;
pub use network::{NetworkConnection, NetworkFactory};
pub use node::StoreNode;
pub use state_machine::StateMachine;
pub use typ::{RecordRaft, Request, Response, TypeConfig};
