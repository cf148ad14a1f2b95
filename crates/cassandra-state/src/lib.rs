//! cassandra-state — versioned record store for the Cassandra scheduler.
//!
//! Records are named byte blobs with a per-record version. Writes are
//! compare-and-set against an expected version and may be grouped into
//! an atomic batch.
//!
//! # Architecture
//!
//! - **`Backend`** is the storage contract. `RecordStore` implements it on
//!   an embedded [redb](https://docs.rs/redb) database; the consensus
//!   backend lives in `cassandra-raft`.
//! - **`Session`** wraps any backend with connection establishment,
//!   per-operation timeouts, read retries and session expiry. Every call
//!   the configuration manager makes goes through a session.
//!
//! `record::apply_ops` holds the CAS rules and is shared by every redb
//! backed implementation so all of them reach the same verdict.

pub mod backend;
pub mod error;
pub mod record;
pub mod session;
pub mod store;
pub mod tables;

pub use backend::Backend;
pub use error::{StoreError, StoreResult};
pub use record::{CasFailure, ExpectedVersion, StoreOp, Version, VersionedRecord};
pub use session::{Session, SessionSettings, SessionState};
pub use store::RecordStore;
