//! RecordStore — embedded redb backend.
//!
//! Serves the versioned record contract from a local redb file, or from
//! memory for tests. Used directly in standalone mode; the consensus
//! backend applies the same batch logic inside its state machine.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase};
use tracing::debug;

use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::record::{self, StoreOp, Version, VersionedRecord};
use crate::tables;

/// Convert any `Display` error into a `StoreError::Backend`.
macro_rules! backend_err {
    ($what:literal) => {
        |e| StoreError::Backend(format!(concat!($what, ": {}"), e))
    };
}

/// Thread-safe versioned record store backed by redb.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
}

impl RecordStore {
    /// Open (or create) a persistent record store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(backend_err!("open"))?;
        let store = Self::with_database(Arc::new(db))?;
        debug!(?path, "record store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory record store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(backend_err!("open"))?;
        let store = Self::with_database(Arc::new(db))?;
        debug!("in-memory record store opened");
        Ok(store)
    }

    /// Wrap an already open database, creating the record tables.
    pub fn with_database(db: Arc<Database>) -> StoreResult<Self> {
        tables::ensure_tables(&db).map_err(backend_err!("create tables"))?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        let txn = self.db.begin_read().map_err(backend_err!("begin read"))?;
        record::read_record(&txn, key).map_err(backend_err!("read"))
    }

    /// Apply a batch atomically. CAS failures leave the store untouched.
    pub fn apply_batch(&self, ops: &[StoreOp]) -> StoreResult<Vec<Version>> {
        let txn = self.db.begin_write().map_err(backend_err!("begin write"))?;
        let outcome = record::apply_ops(&txn, ops).map_err(backend_err!("apply"))?;
        match outcome {
            Ok(versions) => {
                txn.commit().map_err(backend_err!("commit"))?;
                debug!(ops = ops.len(), "batch applied");
                Ok(versions)
            }
            Err(failure) => {
                txn.abort().map_err(backend_err!("abort"))?;
                debug!(?failure, "batch rejected");
                Err(failure.into())
            }
        }
    }

    /// Every record in key order.
    pub fn records(&self) -> StoreResult<Vec<(String, VersionedRecord)>> {
        let txn = self.db.begin_read().map_err(backend_err!("begin read"))?;
        record::dump_records(&txn).map_err(backend_err!("scan"))
    }
}

#[async_trait]
impl Backend for RecordStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn read(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        self.get(key)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<Version>> {
        self.apply_batch(&ops)
    }
}
