//! Versioned records and compare-and-set operations.
//!
//! A record is created at version 0 and every overwrite bumps the
//! version by one. Operations are applied as a batch: either every
//! precondition holds and every op is applied, or nothing changes.

use std::collections::HashMap;
use std::fmt;

use redb::{ReadTransaction, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::tables::{RECORDS, RECORD_VERSIONS};

/// Monotonic per-record version.
pub type Version = u64;

/// Precondition of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The record must not exist yet.
    Absent,
    /// The record must currently be at exactly this version.
    Exact(Version),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Absent => f.write_str("no record"),
            ExpectedVersion::Exact(v) => write!(f, "version {v}"),
        }
    }
}

/// A stored value together with its current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub value: Vec<u8>,
    pub version: Version,
}

/// One step of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Write {
        key: String,
        value: Vec<u8>,
        expected: ExpectedVersion,
    },
    /// `expected: None` deletes whatever version is present.
    Delete {
        key: String,
        expected: Option<Version>,
    },
}

/// Why a batch was rejected. Deterministic given the store contents, so
/// every replica applying the same batch reaches the same verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasFailure {
    Conflict {
        key: String,
        expected: ExpectedVersion,
        actual: Option<Version>,
    },
    AlreadyExists {
        key: String,
        version: Version,
    },
    NotFound {
        key: String,
    },
}

impl StoreOp {
    pub fn write(key: impl Into<String>, value: Vec<u8>, expected: ExpectedVersion) -> Self {
        StoreOp::Write {
            key: key.into(),
            value,
            expected,
        }
    }

    pub fn create(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::write(key, value, ExpectedVersion::Absent)
    }

    pub fn delete(key: impl Into<String>, expected: Option<Version>) -> Self {
        StoreOp::Delete {
            key: key.into(),
            expected,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StoreOp::Write { key, .. } | StoreOp::Delete { key, .. } => key,
        }
    }

    /// Same op addressed at a different key.
    pub fn with_key(self, new_key: String) -> Self {
        match self {
            StoreOp::Write {
                value, expected, ..
            } => StoreOp::Write {
                key: new_key,
                value,
                expected,
            },
            StoreOp::Delete { expected, .. } => StoreOp::Delete {
                key: new_key,
                expected,
            },
        }
    }

    /// Check this op against the record's current version.
    ///
    /// Returns the version the record will have afterwards (`None` once
    /// deleted) and the version reported to the caller.
    pub fn check(&self, current: Option<Version>) -> Result<(Option<Version>, Version), CasFailure> {
        match (self, current) {
            (
                StoreOp::Write {
                    expected: ExpectedVersion::Absent,
                    ..
                },
                None,
            ) => Ok((Some(0), 0)),
            (
                StoreOp::Write {
                    key,
                    expected: ExpectedVersion::Absent,
                    ..
                },
                Some(version),
            ) => Err(CasFailure::AlreadyExists {
                key: key.clone(),
                version,
            }),
            (
                StoreOp::Write {
                    expected: ExpectedVersion::Exact(want),
                    ..
                },
                Some(have),
            ) if *want == have => Ok((Some(have + 1), have + 1)),
            (StoreOp::Write { key, expected, .. }, actual) => Err(CasFailure::Conflict {
                key: key.clone(),
                expected: *expected,
                actual,
            }),
            (StoreOp::Delete { key, .. }, None) => Err(CasFailure::NotFound { key: key.clone() }),
            (StoreOp::Delete { key, expected }, Some(have)) => match expected {
                Some(want) if *want != have => Err(CasFailure::Conflict {
                    key: key.clone(),
                    expected: ExpectedVersion::Exact(*want),
                    actual: Some(have),
                }),
                _ => Ok((None, have)),
            },
        }
    }
}

/// Read one record inside a read transaction.
pub fn read_record(
    txn: &ReadTransaction,
    key: &str,
) -> Result<Option<VersionedRecord>, redb::Error> {
    let versions = txn.open_table(RECORD_VERSIONS)?;
    let Some(version) = versions.get(key)?.map(|guard| guard.value()) else {
        return Ok(None);
    };
    let records = txn.open_table(RECORDS)?;
    let value = records
        .get(key)?
        .map(|guard| guard.value().to_vec())
        .unwrap_or_default();
    Ok(Some(VersionedRecord { value, version }))
}

/// Validate and apply a batch inside a write transaction.
///
/// On a CAS failure nothing is written and the caller must drop the
/// transaction without committing.
pub fn apply_ops(
    txn: &WriteTransaction,
    ops: &[StoreOp],
) -> Result<Result<Vec<Version>, CasFailure>, redb::Error> {
    let mut records = txn.open_table(RECORDS)?;
    let mut versions = txn.open_table(RECORD_VERSIONS)?;

    // Later ops in a batch see the effect of earlier ones.
    let mut staged: HashMap<&str, Option<Version>> = HashMap::new();
    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let key = op.key();
        let current = match staged.get(key) {
            Some(version) => *version,
            None => versions.get(key)?.map(|guard| guard.value()),
        };
        match op.check(current) {
            Ok((next, reported)) => {
                staged.insert(key, next);
                outcomes.push(reported);
            }
            Err(failure) => return Ok(Err(failure)),
        }
    }

    for (op, reported) in ops.iter().zip(&outcomes) {
        match op {
            StoreOp::Write { key, value, .. } => {
                records.insert(key.as_str(), value.as_slice())?;
                versions.insert(key.as_str(), *reported)?;
            }
            StoreOp::Delete { key, .. } => {
                records.remove(key.as_str())?;
                versions.remove(key.as_str())?;
            }
        }
    }
    Ok(Ok(outcomes))
}

/// Every record, in key order.
pub fn dump_records(
    txn: &ReadTransaction,
) -> Result<Vec<(String, VersionedRecord)>, redb::Error> {
    let versions = txn.open_table(RECORD_VERSIONS)?;
    let records = txn.open_table(RECORDS)?;
    let mut out = Vec::new();
    for entry in versions.iter()? {
        let (key, version) = entry?;
        let value = records
            .get(key.value())?
            .map(|guard| guard.value().to_vec())
            .unwrap_or_default();
        out.push((
            key.value().to_string(),
            VersionedRecord {
                value,
                version: version.value(),
            },
        ));
    }
    Ok(out)
}

/// Replace the whole record set, keeping the given versions.
pub fn replace_records(
    txn: &WriteTransaction,
    contents: &[(String, VersionedRecord)],
) -> Result<(), redb::Error> {
    let mut records = txn.open_table(RECORDS)?;
    let mut versions = txn.open_table(RECORD_VERSIONS)?;

    let existing: Vec<String> = versions
        .iter()?
        .map(|entry| entry.map(|(k, _)| k.value().to_string()))
        .collect::<Result<_, _>>()?;
    for key in &existing {
        records.remove(key.as_str())?;
        versions.remove(key.as_str())?;
    }

    for (key, record) in contents {
        records.insert(key.as_str(), record.value.as_slice())?;
        versions.insert(key.as_str(), record.version)?;
    }
    Ok(())
}
