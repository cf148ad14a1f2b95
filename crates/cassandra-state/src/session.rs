//! Store session — the single funnel for every record store call.
//!
//! A `Session` wraps a `Backend` with the liveness rules the rest of the
//! scheduler relies on: bounded connection establishment, a per-operation
//! deadline, retry of idempotent reads, and session expiry once the
//! backend has been unreachable for longer than the session timeout.
//! Idle sessions stay current through `heartbeat`. Writes
//! are never retried here; an ambiguous write is reported as such and the
//! caller re-reads before deciding what to do.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cassandra_core::StoreConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::record::{ExpectedVersion, StoreOp, Version, VersionedRecord};

/// Connection settings for a store session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub endpoints: Vec<String>,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    pub retry_backoff: Duration,
    /// Prefix prepended to every record key, e.g. `/mesos`.
    pub root_path: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for SessionSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            session_timeout: config.session_timeout(),
            connection_timeout: config.connection_timeout(),
            operation_timeout: config.operation_timeout(),
            retry_backoff: config.retry_backoff(),
            root_path: config.root_path.clone(),
        }
    }
}

/// Liveness of a session as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Unreachable for longer than the session timeout. Only `reconnect`
    /// helps.
    Expired,
    Closed,
}

#[derive(Debug)]
struct Liveness {
    state: SessionState,
    /// Start of the current run of failed contacts.
    unreachable_since: Option<Instant>,
}

/// A live connection to the record store.
pub struct Session {
    backend: Arc<dyn Backend>,
    settings: SessionSettings,
    prefix: String,
    liveness: Mutex<Liveness>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoints", &self.settings.endpoints)
            .field("prefix", &self.prefix)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Establish a session, retrying with `retry_backoff` until
    /// `connection_timeout` elapses.
    pub async fn connect(backend: Arc<dyn Backend>, settings: SessionSettings) -> StoreResult<Self> {
        let prefix = normalize_root(settings.root_path.as_deref())?;
        establish(backend.as_ref(), &settings).await?;
        info!(endpoints = ?settings.endpoints, root = %prefix, "store session established");
        Ok(Self {
            backend,
            settings,
            prefix,
            liveness: Mutex::new(Liveness {
                state: SessionState::Connected,
                unreachable_since: None,
            }),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.liveness().state
    }

    pub async fn read(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        let path = self.qualify(key)?;
        let record = self
            .call("read", true, || self.backend.read(&path))
            .await?;
        debug!(key = %path, version = ?record.as_ref().map(|r| r.version), "read");
        Ok(record)
    }

    /// Compare-and-set write of a single record.
    pub async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: ExpectedVersion,
    ) -> StoreResult<Version> {
        let versions = self
            .write_batch(vec![StoreOp::write(key, value, expected)])
            .await?;
        single_version(versions)
    }

    /// Create a record that must not exist yet. `AlreadyExists` means
    /// another writer got there first.
    pub async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Version> {
        self.write(key, value, ExpectedVersion::Absent).await
    }

    /// Delete a record, optionally only at a given version.
    pub async fn delete(&self, key: &str, expected: Option<Version>) -> StoreResult<()> {
        self.write_batch(vec![StoreOp::delete(key, expected)])
            .await
            .map(|_| ())
    }

    /// Apply several ops atomically: all preconditions hold and every op
    /// lands, or nothing changes.
    pub async fn write_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<Version>> {
        let ops = ops
            .into_iter()
            .map(|op| {
                let path = self.qualify(op.key())?;
                Ok(op.with_key(path))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let keys: Vec<&str> = ops.iter().map(StoreOp::key).collect();
        debug!(?keys, "applying batch");

        self.call("write", false, || self.backend.apply(ops.clone()))
            .await
    }

    /// Re-establish an expired (or still live) session. Callers must
    /// re-read any state they cached before the outage.
    pub async fn reconnect(&self) -> StoreResult<()> {
        if self.state() == SessionState::Closed {
            return Err(StoreError::SessionClosed);
        }
        establish(self.backend.as_ref(), &self.settings).await?;
        let mut liveness = self.liveness();
        liveness.state = SessionState::Connected;
        liveness.unreachable_since = None;
        info!("store session re-established");
        Ok(())
    }

    /// Ping the backend outside of any record operation.
    ///
    /// A success clears any outage in progress; a failure extends it and
    /// expires the session once it has lasted `session_timeout`.
    pub async fn heartbeat(&self) -> StoreResult<()> {
        self.ensure_usable()?;
        let limit = self.settings.operation_timeout;
        let outcome = match tokio::time::timeout(limit, self.backend.ping()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Timeout { op: "ping", after: limit }),
        };
        match outcome {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(_) if self.note_failure() => Err(StoreError::SessionExpired),
            Err(e) => {
                debug!(error = %e, "heartbeat failed");
                Err(e)
            }
        }
    }

    /// Release the session. Records are left in place.
    pub async fn close(&self) -> StoreResult<()> {
        {
            let mut liveness = self.liveness();
            if liveness.state == SessionState::Closed {
                return Ok(());
            }
            liveness.state = SessionState::Closed;
        }
        info!("store session closed");
        self.backend.close().await
    }

    fn liveness(&self) -> MutexGuard<'_, Liveness> {
        self.liveness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn qualify(&self, key: &str) -> StoreResult<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::Expired => Err(StoreError::SessionExpired),
            SessionState::Closed => Err(StoreError::SessionClosed),
        }
    }

    fn touch(&self) {
        let mut liveness = self.liveness();
        if liveness.state == SessionState::Connected {
            liveness.unreachable_since = None;
        }
    }

    /// Record a failed contact. Returns true once the session has expired.
    fn note_failure(&self) -> bool {
        let mut liveness = self.liveness();
        match liveness.state {
            SessionState::Connected => {
                let since = *liveness.unreachable_since.get_or_insert_with(Instant::now);
                let unreachable_for = since.elapsed();
                if unreachable_for >= self.settings.session_timeout {
                    liveness.state = SessionState::Expired;
                    warn!(?unreachable_for, "store session expired");
                    true
                } else {
                    false
                }
            }
            SessionState::Expired => true,
            SessionState::Closed => false,
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, retry: bool, mut attempt: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.ensure_usable()?;
        let limit = self.settings.operation_timeout;
        let deadline = Instant::now() + limit;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, attempt()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if self.note_failure() {
                        return Err(StoreError::SessionExpired);
                    }
                    warn!(op, ?limit, "store operation timed out");
                    return Err(StoreError::Timeout { op, after: limit });
                }
            };

            match outcome {
                Err(StoreError::Unreachable(reason)) => {
                    if self.note_failure() {
                        return Err(StoreError::SessionExpired);
                    }
                    if !retry {
                        warn!(op, %reason, "connection lost during write");
                        return Err(StoreError::ConnectionLoss { op });
                    }
                    let pause = self
                        .settings
                        .retry_backoff
                        .min(deadline.saturating_duration_since(Instant::now()));
                    if pause.is_zero() {
                        return Err(StoreError::Timeout { op, after: limit });
                    }
                    debug!(op, %reason, ?pause, "store unreachable, retrying");
                    tokio::time::sleep(pause).await;
                }
                other => {
                    self.touch();
                    return other;
                }
            }
        }
    }
}

async fn establish(backend: &dyn Backend, settings: &SessionSettings) -> StoreResult<()> {
    let deadline = Instant::now() + settings.connection_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let failure = match tokio::time::timeout(remaining, backend.ping()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "ping timed out".to_string(),
        };

        let pause = settings
            .retry_backoff
            .min(deadline.saturating_duration_since(Instant::now()));
        if pause.is_zero() {
            warn!(attempts, %failure, "no store server reachable");
            return Err(StoreError::Unavailable(format!(
                "no server in {:?} reachable within {:?} ({failure})",
                settings.endpoints, settings.connection_timeout
            )));
        }
        debug!(attempts, %failure, "store not reachable yet, retrying");
        tokio::time::sleep(pause).await;
    }
}

fn single_version(versions: Vec<Version>) -> StoreResult<Version> {
    versions
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Backend("backend acknowledged no ops".to_string()))
}

/// Keys are absolute paths of non-empty segments, e.g. `/cassandra/seeds`.
fn validate_key(key: &str) -> StoreResult<()> {
    let Some(rest) = key.strip_prefix('/') else {
        return Err(StoreError::InvalidKey(key.to_string()));
    };
    if rest.is_empty() || rest.split('/').any(str::is_empty) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn normalize_root(root: Option<&str>) -> StoreResult<String> {
    let Some(root) = root.map(|r| r.trim_end_matches('/')) else {
        return Ok(String::new());
    };
    if root.is_empty() {
        return Ok(String::new());
    }
    validate_key(root)?;
    Ok(root.to_string())
}
