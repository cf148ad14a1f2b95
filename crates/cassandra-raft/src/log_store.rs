//! Replicated-log persistence for the store nodes.
//!
//! Entries sit under their index in `store_log`; hard state (vote,
//! commit point, purge point) sits in `store_log_state`. Both are JSON.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, StorageError, Vote};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::storage_err::{read_err, write_err};
use crate::typ::TypeConfig;

type StorageResult<T> = Result<T, StorageError<u64>>;

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("store_log");
const HARD_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("store_log_state");

/// Hard-state slots kept next to the log.
#[derive(Clone, Copy)]
enum HardState {
    Vote,
    Committed,
    Purged,
}

impl HardState {
    fn key(self) -> &'static str {
        match self {
            HardState::Vote => "vote",
            HardState::Committed => "committed",
            HardState::Purged => "last_purged",
        }
    }
}

fn decode_entry(bytes: &[u8]) -> StorageResult<Entry<TypeConfig>> {
    serde_json::from_slice(bytes).map_err(read_err)
}

pub struct LogStore {
    db: Arc<Database>,
}

/// Read-only view handed to replication tasks.
pub struct LogReader {
    db: Arc<Database>,
}

impl LogStore {
    /// Open the log tables in `db`, creating them on first use.
    pub fn new(db: Arc<Database>) -> StorageResult<Self> {
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(LOG_TABLE).map_err(write_err)?;
        txn.open_table(HARD_STATE_TABLE).map_err(write_err)?;
        txn.commit().map_err(write_err)?;
        Ok(Self { db })
    }

    fn reader(&self) -> LogReader {
        LogReader {
            db: Arc::clone(&self.db),
        }
    }

    fn put_state<T: Serialize>(&self, slot: HardState, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(HARD_STATE_TABLE).map_err(write_err)?;
            table.insert(slot.key(), bytes.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)
    }

    fn get_state<T: DeserializeOwned>(&self, slot: HardState) -> StorageResult<Option<T>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(HARD_STATE_TABLE).map_err(read_err)?;
        table
            .get(slot.key())
            .map_err(read_err)?
            .map(|raw| serde_json::from_slice(raw.value()).map_err(read_err))
            .transpose()
    }

    fn last_entry_id(&self) -> StorageResult<Option<LogId<u64>>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_err)?;
        table
            .last()
            .map_err(read_err)?
            .map(|(_, raw)| decode_entry(raw.value()).map(|e| e.log_id))
            .transpose()
    }

    /// Drop every entry whose index falls in `range`; returns how many went.
    fn drop_entries<R: RangeBounds<u64> + 'static>(&self, range: R) -> StorageResult<usize> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let dropped = {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            let doomed = table
                .range(range)
                .map_err(write_err)?
                .map(|item| item.map(|(index, _)| index.value()))
                .collect::<Result<Vec<u64>, _>>()
                .map_err(write_err)?;
            for index in &doomed {
                table.remove(*index).map_err(write_err)?;
            }
            doomed.len()
        };
        txn.commit().map_err(write_err)?;
        Ok(dropped)
    }
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<Entry<TypeConfig>>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_err)?;
        table
            .range(range)
            .map_err(read_err)?
            .map(|item| {
                let (_, raw) = item.map_err(read_err)?;
                decode_entry(raw.value())
            })
            .collect()
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<Entry<TypeConfig>>> {
        self.reader().try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(&mut self) -> StorageResult<LogState<TypeConfig>> {
        let last_purged_log_id: Option<LogId<u64>> = self.get_state(HardState::Purged)?;
        // An empty log ends where the purge stopped.
        let last_log_id = self.last_entry_id()?.or(last_purged_log_id);
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.reader()
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> StorageResult<()> {
        self.put_state(HardState::Vote, vote)?;
        debug!(?vote, "vote persisted");
        Ok(())
    }

    async fn read_vote(&mut self) -> StorageResult<Option<Vote<u64>>> {
        self.get_state(HardState::Vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId<u64>>) -> StorageResult<()> {
        match committed {
            Some(log_id) => self.put_state(HardState::Committed, &log_id),
            None => Ok(()),
        }
    }

    async fn read_committed(&mut self) -> StorageResult<Option<LogId<u64>>> {
        self.get_state(HardState::Committed)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> StorageResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            for entry in entries {
                let bytes = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .map_err(write_err)?;
            }
        }
        // A redb commit is durable once it returns.
        txn.commit().map_err(write_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> StorageResult<()> {
        let dropped = self.drop_entries(log_id.index..)?;
        debug!(from = log_id.index, dropped, "log tail truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> StorageResult<()> {
        self.put_state(HardState::Purged, &log_id)?;
        let dropped = self.drop_entries(..=log_id.index)?;
        debug!(upto = log_id.index, dropped, "log head purged");
        Ok(())
    }
}
