//! The configuration record set and its byte encoding.
//!
//! Each member is stored under `/{framework_name}/{record}` with the
//! serializer bound to its type: JSON for the composite records, decimal
//! strings for the counters, plain text for the rest.

use std::collections::BTreeMap;
use std::fmt;

use cassandra_core::{
    CassandraConfig, ClusterConfiguration, ExecutorConfig, Identity, IntegerStringSerializer,
    PlacementStrategySerializer, SerializationResult, Serializer, StringSerializer,
};
use cassandra_state::{Version, VersionedRecord};

use crate::error::{ConfigError, ConfigResult};

/// One member of the configuration record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Identity,
    CassandraConfig,
    ExecutorConfig,
    Servers,
    Seeds,
    PlacementStrategy,
    SeedsUrl,
}

impl RecordKey {
    /// Every member, in initialization order. Identity goes first so that
    /// racing initializers are decided on the first write.
    pub const ALL: [RecordKey; 7] = [
        RecordKey::Identity,
        RecordKey::CassandraConfig,
        RecordKey::ExecutorConfig,
        RecordKey::Servers,
        RecordKey::Seeds,
        RecordKey::PlacementStrategy,
        RecordKey::SeedsUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKey::Identity => "identity",
            RecordKey::CassandraConfig => "cassandra-config",
            RecordKey::ExecutorConfig => "executor-config",
            RecordKey::Servers => "servers",
            RecordKey::Seeds => "seeds",
            RecordKey::PlacementStrategy => "placement-strategy",
            RecordKey::SeedsUrl => "seeds-url",
        }
    }

    /// Store key of this record under `namespace`.
    pub fn path(&self, namespace: &str) -> String {
        format!("{namespace}/{}", self.as_str())
    }

    /// Serialize the part of `config` this record holds.
    pub fn encode(&self, config: &ClusterConfiguration) -> SerializationResult<Vec<u8>> {
        match self {
            RecordKey::Identity => Identity::JSON_SERIALIZER.serialize(&config.identity),
            RecordKey::CassandraConfig => CassandraConfig::JSON_SERIALIZER.serialize(&config.cassandra),
            RecordKey::ExecutorConfig => ExecutorConfig::JSON_SERIALIZER.serialize(&config.executor),
            RecordKey::Servers => IntegerStringSerializer.serialize(&config.topology.servers),
            RecordKey::Seeds => IntegerStringSerializer.serialize(&config.topology.seeds),
            RecordKey::PlacementStrategy => {
                PlacementStrategySerializer.serialize(&config.topology.placement)
            }
            RecordKey::SeedsUrl => StringSerializer.serialize(&config.topology.seeds_url),
        }
    }

    /// Decode `bytes` and store the value in the matching field of `config`.
    pub fn decode_into(&self, bytes: &[u8], config: &mut ClusterConfiguration) -> SerializationResult<()> {
        match self {
            RecordKey::Identity => config.identity = Identity::JSON_SERIALIZER.deserialize(bytes)?,
            RecordKey::CassandraConfig => {
                config.cassandra = CassandraConfig::JSON_SERIALIZER.deserialize(bytes)?
            }
            RecordKey::ExecutorConfig => {
                config.executor = ExecutorConfig::JSON_SERIALIZER.deserialize(bytes)?
            }
            RecordKey::Servers => config.topology.servers = IntegerStringSerializer.deserialize(bytes)?,
            RecordKey::Seeds => config.topology.seeds = IntegerStringSerializer.deserialize(bytes)?,
            RecordKey::PlacementStrategy => {
                config.topology.placement = PlacementStrategySerializer.deserialize(bytes)?
            }
            RecordKey::SeedsUrl => config.topology.seeds_url = StringSerializer.deserialize(bytes)?,
        }
        Ok(())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace of a framework's record set.
pub fn namespace(framework_name: &str) -> String {
    format!("/{framework_name}")
}

/// Records as read from the store, keyed by member.
pub type RecordSet = BTreeMap<RecordKey, VersionedRecord>;

/// Overlay every record in `records` on `base`.
///
/// Fails with `MalformedRecord` on the first record that does not decode.
/// The result is not validated as a whole.
pub fn compose(base: &ClusterConfiguration, records: &RecordSet) -> ConfigResult<ClusterConfiguration> {
    let mut config = base.clone();
    for (key, record) in records {
        key.decode_into(&record.value, &mut config)
            .map_err(|e| ConfigError::MalformedRecord {
                key: *key,
                reason: e.to_string(),
            })?;
    }
    Ok(config)
}

/// Versions of the records in `records`.
pub fn versions(records: &RecordSet) -> BTreeMap<RecordKey, Version> {
    records
        .iter()
        .map(|(key, record)| (*key, record.version))
        .collect()
}

/// Members of the set not present in `records`.
pub fn missing(records: &RecordSet) -> Vec<RecordKey> {
    RecordKey::ALL
        .into_iter()
        .filter(|key| !records.contains_key(key))
        .collect()
}
