//! The contract every record store backend implements.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::record::{StoreOp, Version, VersionedRecord};

/// A strongly consistent, versioned key/value store.
///
/// Backends report transport failures as `StoreError::Unreachable` and
/// leave session bookkeeping, timeouts and retries to `Session`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Liveness probe used while establishing a session.
    async fn ping(&self) -> StoreResult<()>;

    async fn read(&self, key: &str) -> StoreResult<Option<VersionedRecord>>;

    /// Apply a batch atomically, returning one version per op.
    async fn apply(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<Version>>;

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
