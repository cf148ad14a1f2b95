//! cassandra-config — the configuration manager of the Cassandra scheduler.
//!
//! `ConfigurationManager` owns the cluster's persisted configuration record
//! set. It runs the startup sequence (recover, first-run initialize, or
//! repair a partial set), serves consistent snapshot reads, and applies
//! reconfiguration as compare-and-set batches through a store `Session`.

pub mod error;
pub mod manager;
pub mod records;

#[cfg(test)]
mod test_support;

pub use error::{ConfigError, ConfigResult};
pub use manager::{
    ConfigSnapshot, ConfigurationManager, ConfigurationUpdate, ManagerOptions, ManagerPhase,
};
pub use records::RecordKey;
