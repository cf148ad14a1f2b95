//! Record serializers.
//!
//! Each persisted type has its own serializer so the byte layout is a
//! deliberate choice per type: composite records are camelCase JSON with
//! absent optionals omitted, counters are plain decimal strings. Decoders
//! validate the value after structural decoding and never hand back a
//! partially recovered value.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{SerializationError, SerializationResult, ValidationResult};
use crate::types::{CassandraConfig, ExecutorConfig, Identity, PlacementStrategy};

/// Bidirectional mapping between a value and its stored bytes.
///
/// `deserialize(serialize(x)) == x` for every valid `x`.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> SerializationResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> SerializationResult<T>;
}

fn encode_json<T: Serialize>(value: &T) -> SerializationResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SerializationError::Encode(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> SerializationResult<T> {
    serde_json::from_slice(bytes).map_err(|e| SerializationError::Malformed(e.to_string()))
}

fn reject_invalid(result: ValidationResult<()>) -> SerializationResult<()> {
    result.map_err(|e| SerializationError::Malformed(e.to_string()))
}

/// JSON encoding for one composite record type.
///
/// Only instantiated through the per-type aliases below, each of which
/// pins the validation run on both sides of the mapping.
pub struct JsonRecordSerializer<T> {
    validate: fn(&T) -> ValidationResult<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonRecordSerializer<T> {
    const fn with_validation(validate: fn(&T) -> ValidationResult<()>) -> Self {
        Self {
            validate,
            _record: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonRecordSerializer<T> {
    fn serialize(&self, value: &T) -> SerializationResult<Vec<u8>> {
        (self.validate)(value)?;
        encode_json(value)
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializationResult<T> {
        let value: T = decode_json(bytes)?;
        reject_invalid((self.validate)(&value))?;
        Ok(value)
    }
}

pub type IdentitySerializer = JsonRecordSerializer<Identity>;
pub type CassandraConfigSerializer = JsonRecordSerializer<CassandraConfig>;
pub type ExecutorConfigSerializer = JsonRecordSerializer<ExecutorConfig>;

impl Identity {
    pub const JSON_SERIALIZER: IdentitySerializer =
        JsonRecordSerializer::with_validation(Identity::validate);
}

impl CassandraConfig {
    pub const JSON_SERIALIZER: CassandraConfigSerializer =
        JsonRecordSerializer::with_validation(CassandraConfig::validate);
}

impl ExecutorConfig {
    pub const JSON_SERIALIZER: ExecutorConfigSerializer =
        JsonRecordSerializer::with_validation(ExecutorConfig::validate);
}

/// Counters stored as their decimal string, e.g. `b"3"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerStringSerializer;

impl Serializer<u32> for IntegerStringSerializer {
    fn serialize(&self, value: &u32) -> SerializationResult<Vec<u8>> {
        Ok(value.to_string().into_bytes())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializationResult<u32> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        text.parse::<u32>()
            .map_err(|e| SerializationError::Malformed(format!("{text:?}: {e}")))
    }
}

/// Placement strategy stored as its upper-case name.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementStrategySerializer;

impl Serializer<PlacementStrategy> for PlacementStrategySerializer {
    fn serialize(&self, value: &PlacementStrategy) -> SerializationResult<Vec<u8>> {
        Ok(value.as_str().as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializationResult<PlacementStrategy> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        match text {
            "NODE" => Ok(PlacementStrategy::Node),
            "ANY" => Ok(PlacementStrategy::Any),
            other => Err(SerializationError::Malformed(format!(
                "unknown placement strategy {other:?}"
            ))),
        }
    }
}

/// Plain UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> SerializationResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> SerializationResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| SerializationError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_JMX_PORT;

    fn cassandra(replace_ip: Option<&str>) -> CassandraConfig {
        CassandraConfig {
            version: "2.2.5".to_string(),
            cpus: 0.5,
            memory_mb: 4096,
            disk_mb: 10240,
            jmx_port: DEFAULT_JMX_PORT,
            replace_ip: replace_ip.map(str::to_string),
        }
    }

    fn executor() -> ExecutorConfig {
        ExecutorConfig {
            command: "./executor/bin/cassandra-executor".to_string(),
            arguments: vec!["server".to_string(), "executor.yml".to_string()],
            cpus: 0.1,
            memory_mb: 768,
            disk_mb: 1024,
            heap_mb: 256,
            api_port: 9001,
            uris: vec!["https://downloads.example.com/cassandra-executor.zip".to_string()],
            java_home: Some("./jre".to_string()),
        }
    }

    #[test]
    fn absent_replace_ip_is_omitted_not_wrapped() {
        let bytes = CassandraConfig::JSON_SERIALIZER
            .serialize(&cassandra(None))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let object = json.as_object().unwrap();

        assert!(!object.contains_key("replaceIp"));
        assert!(!String::from_utf8(bytes).unwrap().contains("present"));
        assert_eq!(object["memoryMb"], 4096);
        assert_eq!(object["diskMb"], 10240);
    }

    #[test]
    fn present_replace_ip_is_a_plain_string() {
        let bytes = CassandraConfig::JSON_SERIALIZER
            .serialize(&cassandra(Some("10.0.0.7")))
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["replaceIp"], "10.0.0.7");
    }

    #[test]
    fn cassandra_config_roundtrips_with_and_without_replace_ip() {
        for config in [cassandra(None), cassandra(Some("node-3.cassandra.mesos"))] {
            let bytes = CassandraConfig::JSON_SERIALIZER.serialize(&config).unwrap();
            let back = CassandraConfig::JSON_SERIALIZER.deserialize(&bytes).unwrap();
            assert_eq!(back, config);
        }
    }

    #[test]
    fn null_replace_ip_decodes_as_absent() {
        let raw = br#"{"version":"2.2.5","cpus":0.5,"memoryMb":4096,"diskMb":10240,"replaceIp":null}"#;
        let config = CassandraConfig::JSON_SERIALIZER.deserialize(raw).unwrap();
        assert_eq!(config, cassandra(None));
    }

    #[test]
    fn presence_wrapper_is_rejected() {
        let raw = br#"{"version":"2.2.5","cpus":0.5,"memoryMb":4096,"diskMb":10240,"replaceIp":{"present":false}}"#;
        let err = CassandraConfig::JSON_SERIALIZER.deserialize(raw).unwrap_err();
        assert!(matches!(err, SerializationError::Malformed(_)));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let raw = br#"{"version":"2.2.5","cpus":0.5,"diskMb":10240}"#;
        let err = CassandraConfig::JSON_SERIALIZER.deserialize(raw).unwrap_err();
        assert!(matches!(err, SerializationError::Malformed(_)));
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        let raw = br#"{"version":"2.2.5","cpus":"half","memoryMb":4096,"diskMb":10240}"#;
        let err = CassandraConfig::JSON_SERIALIZER.deserialize(raw).unwrap_err();
        assert!(matches!(err, SerializationError::Malformed(_)));
    }

    #[test]
    fn invariant_violation_on_decode_is_malformed() {
        let raw = br#"{"version":"2.2.5","cpus":0.5,"memoryMb":0,"diskMb":10240}"#;
        let err = CassandraConfig::JSON_SERIALIZER.deserialize(raw).unwrap_err();
        assert!(matches!(err, SerializationError::Malformed(_)));
    }

    #[test]
    fn invalid_value_is_refused_on_encode() {
        let mut config = cassandra(None);
        config.disk_mb = 0;
        let err = CassandraConfig::JSON_SERIALIZER.serialize(&config).unwrap_err();
        assert!(matches!(err, SerializationError::Invalid(_)));
    }

    #[test]
    fn executor_config_roundtrips() {
        let config = executor();
        let bytes = ExecutorConfig::JSON_SERIALIZER.serialize(&config).unwrap();
        assert_eq!(ExecutorConfig::JSON_SERIALIZER.deserialize(&bytes).unwrap(), config);

        let mut bare = executor();
        bare.java_home = None;
        let bytes = ExecutorConfig::JSON_SERIALIZER.serialize(&bare).unwrap();
        assert!(!String::from_utf8(bytes.clone()).unwrap().contains("javaHome"));
        assert_eq!(ExecutorConfig::JSON_SERIALIZER.deserialize(&bytes).unwrap(), bare);
    }

    #[test]
    fn fractional_cpus_keep_every_digit() {
        for cpus in [1.2000000012000003, 2.4000000024000006, 0.1 + 0.2, 3.9000000039000002] {
            let mut config = cassandra(None);
            config.cpus = cpus;
            let bytes = CassandraConfig::JSON_SERIALIZER.serialize(&config).unwrap();
            let back = CassandraConfig::JSON_SERIALIZER.deserialize(&bytes).unwrap();
            assert_eq!(back.cpus.to_bits(), cpus.to_bits(), "cpus {cpus:?}");

            let mut exec = executor();
            exec.cpus = cpus;
            let bytes = ExecutorConfig::JSON_SERIALIZER.serialize(&exec).unwrap();
            let back = ExecutorConfig::JSON_SERIALIZER.deserialize(&bytes).unwrap();
            assert_eq!(back.cpus.to_bits(), cpus.to_bits(), "cpus {cpus:?}");
        }
    }

    #[test]
    fn identity_without_id_omits_the_key() {
        let identity = Identity {
            name: "cassandra".to_string(),
            id: None,
            role: "cassandra_role".to_string(),
            principal: "cassandra_principal".to_string(),
            secret: None,
            failover_timeout_secs: 604800,
            checkpoint: true,
        };
        let bytes = Identity::JSON_SERIALIZER.serialize(&identity).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(Identity::JSON_SERIALIZER.deserialize(&bytes).unwrap(), identity);
    }

    #[test]
    fn integers_are_decimal_strings() {
        assert_eq!(IntegerStringSerializer.serialize(&3).unwrap(), b"3");
        assert_eq!(IntegerStringSerializer.deserialize(b"42").unwrap(), 42);
        assert!(IntegerStringSerializer.deserialize(b"").is_err());
        assert!(IntegerStringSerializer.deserialize(b"three").is_err());
        assert!(IntegerStringSerializer.deserialize(b"-1").is_err());
        assert!(IntegerStringSerializer.deserialize(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn placement_strategy_names() {
        assert_eq!(
            PlacementStrategySerializer.serialize(&PlacementStrategy::Node).unwrap(),
            b"NODE"
        );
        assert_eq!(
            PlacementStrategySerializer.deserialize(b"ANY").unwrap(),
            PlacementStrategy::Any
        );
        assert!(PlacementStrategySerializer.deserialize(b"node").is_err());
    }
}
