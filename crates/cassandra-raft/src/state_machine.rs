//! Applies committed store batches to the redb record tables.
//!
//! Committed `Request::Apply` entries run through the same CAS rules as
//! the embedded store (`cassandra_state::record::apply_ops`), writing the
//! record tables and the applied log id in one transaction. Snapshots are
//! the JSON-encoded record set with versions preserved.

use std::io::Cursor;
use std::sync::Arc;

use cassandra_state::record::{self, VersionedRecord};
use cassandra_state::tables;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership,
};
use redb::{
    Database, ReadOnlyTable, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use tracing::{debug, info};

use crate::storage_err::{read_err, write_err};
use crate::typ::{Request, Response, TypeConfig};

/// Applied log id and membership, JSON-encoded.
const SM_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("store_applied");

const APPLIED_KEY: &str = "last_applied";
const MEMBERSHIP_KEY: &str = "membership";

type Membership = StoredMembership<u64, BasicNode>;

fn meta_value<T: serde::de::DeserializeOwned>(
    table: &ReadOnlyTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StorageError<u64>> {
    table
        .get(key)
        .map_err(read_err)?
        .map(|raw| serde_json::from_slice(raw.value()).map_err(read_err))
        .transpose()
}

pub struct StateMachine {
    db: Arc<Database>,
}

/// Builds snapshots from a single read of the record tables.
pub struct RecordSnapshotBuilder {
    db: Arc<Database>,
}

impl StateMachine {
    /// Open the record and metadata tables in the given database.
    pub fn new(db: Arc<Database>) -> Result<Self, StorageError<u64>> {
        tables::ensure_tables(&db).map_err(write_err)?;
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(SM_META_TABLE).map_err(write_err)?;
        txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        db: &Database,
        key: &str,
    ) -> Result<Option<T>, StorageError<u64>> {
        let txn = db.begin_read().map_err(read_err)?;
        let table = txn.open_table(SM_META_TABLE).map_err(read_err)?;
        meta_value(&table, key)
    }

    fn write_meta<T: serde::Serialize>(
        txn: &WriteTransaction,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(value).map_err(write_err)?;
        let mut table = txn.open_table(SM_META_TABLE).map_err(write_err)?;
        table.insert(key, data.as_slice()).map_err(write_err)?;
        Ok(())
    }

    fn apply_entry(&self, entry: Entry<TypeConfig>) -> Result<Response, StorageError<u64>> {
        let log_id = entry.log_id;
        let txn = self.db.begin_write().map_err(write_err)?;

        let response = match entry.payload {
            EntryPayload::Blank => Response::empty(),
            EntryPayload::Normal(Request::Apply { ops }) => {
                // A rejected batch writes nothing; only the applied id moves.
                let outcome = record::apply_ops(&txn, &ops).map_err(write_err)?;
                debug!(index = log_id.index, ops = ops.len(), accepted = outcome.is_ok(), "applied batch");
                Response { outcome }
            }
            EntryPayload::Membership(membership) => {
                let stored = StoredMembership::new(Some(log_id), membership);
                Self::write_meta(&txn, MEMBERSHIP_KEY, &stored)?;
                Response::empty()
            }
        };

        Self::write_meta(&txn, APPLIED_KEY, &log_id)?;
        txn.commit().map_err(write_err)?;
        Ok(response)
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = RecordSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, Membership), StorageError<u64>> {
        let applied = Self::read_meta(&self.db, APPLIED_KEY)?;
        let membership = Self::read_meta(&self.db, MEMBERSHIP_KEY)?.unwrap_or_default();
        Ok((applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        entries
            .into_iter()
            .map(|entry| self.apply_entry(entry))
            .collect()
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        RecordSnapshotBuilder {
            db: Arc::clone(&self.db),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let contents: Vec<(String, VersionedRecord)> =
            serde_json::from_slice(&snapshot.into_inner()).map_err(read_err)?;

        let txn = self.db.begin_write().map_err(write_err)?;
        record::replace_records(&txn, &contents).map_err(write_err)?;
        Self::write_meta(&txn, APPLIED_KEY, &meta.last_log_id)?;
        Self::write_meta(&txn, MEMBERSHIP_KEY, &meta.last_membership)?;
        txn.commit().map_err(write_err)?;

        info!(snapshot = %meta.snapshot_id, records = contents.len(), "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if Self::read_meta::<LogId<u64>>(&self.db, APPLIED_KEY)?.is_none() {
            return Ok(None);
        }
        let mut builder = self.get_snapshot_builder().await;
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RecordSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        // One read transaction so records and metadata agree.
        let txn = self.db.begin_read().map_err(read_err)?;
        let contents = record::dump_records(&txn).map_err(read_err)?;

        let applied = txn.open_table(SM_META_TABLE).map_err(read_err)?;
        let last_applied: Option<LogId<u64>> = meta_value(&applied, APPLIED_KEY)?;
        let membership: Membership = meta_value(&applied, MEMBERSHIP_KEY)?.unwrap_or_default();

        let data = serde_json::to_vec(&contents).map_err(read_err)?;
        let snapshot_id = match last_applied {
            Some(log_id) => format!("records-{}-{}", log_id.leader_id.term, log_id.index),
            None => "records-empty".to_string(),
        };
        debug!(%snapshot_id, records = contents.len(), "built snapshot");

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership: membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
