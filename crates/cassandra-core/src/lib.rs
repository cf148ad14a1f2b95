//! cassandra-core — domain types shared by the Cassandra scheduler crates.
//!
//! - **`types`** — the configuration record set (identity, node and
//!   executor resources, ring topology) and its invariants
//! - **`serialization`** — per-type record serializers
//! - **`config`** — the `scheduler.toml` bootstrap file

pub mod config;
pub mod error;
pub mod serialization;
pub mod types;

pub use config::{SchedulerConfig, StoreConfig};
pub use error::{SerializationError, SerializationResult, ValidationError, ValidationResult};
pub use serialization::*;
pub use types::*;
