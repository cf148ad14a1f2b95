//! ConfigurationManager — lifecycle and cached view of the record set.
//!
//! `start` recovers the record set from the store, initializes it from the
//! bootstrap defaults on first run, or repairs a set a crashed initializer
//! left half written. Reads are then served from an immutable snapshot;
//! updates land in the store as one compare-and-set batch before the
//! snapshot is swapped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use cassandra_core::{
    CassandraConfig, ClusterConfiguration, ExecutorConfig, Identity, PlacementStrategy,
};
use cassandra_state::{ExpectedVersion, Session, SessionState, StoreError, StoreOp, Version};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::records::{self, RecordKey, RecordSet};

pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// How long to wait for another initializer to complete the record set
    /// before repairing it from this instance's defaults.
    pub convergence_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            convergence_timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerPhase {
    Uninitialized,
    Recovering,
    Initializing,
    Ready,
    Failed,
    Stopped,
}

impl ManagerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerPhase::Uninitialized => "UNINITIALIZED",
            ManagerPhase::Recovering => "RECOVERING",
            ManagerPhase::Initializing => "INITIALIZING",
            ManagerPhase::Ready => "READY",
            ManagerPhase::Failed => "FAILED",
            ManagerPhase::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decoded record set and the version each record was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub config: ClusterConfiguration,
    pub versions: BTreeMap<RecordKey, Version>,
}

impl ConfigSnapshot {
    pub fn version(&self, key: RecordKey) -> Option<Version> {
        self.versions.get(&key).copied()
    }
}

/// Changes applied by one `update` call. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationUpdate {
    pub servers: Option<u32>,
    pub seeds: Option<u32>,
    pub placement: Option<PlacementStrategy>,
    pub seeds_url: Option<String>,
    pub cassandra: Option<CassandraConfig>,
    pub executor: Option<ExecutorConfig>,
}

impl ConfigurationUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(mut self, servers: u32) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn seeds(mut self, seeds: u32) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn seeds_url(mut self, url: impl Into<String>) -> Self {
        self.seeds_url = Some(url.into());
        self
    }

    pub fn cassandra(mut self, config: CassandraConfig) -> Self {
        self.cassandra = Some(config);
        self
    }

    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = Some(config);
        self
    }

    fn apply_to(self, config: &mut ClusterConfiguration) {
        if let Some(servers) = self.servers {
            config.topology.servers = servers;
        }
        if let Some(seeds) = self.seeds {
            config.topology.seeds = seeds;
        }
        if let Some(placement) = self.placement {
            config.topology.placement = placement;
        }
        if let Some(url) = self.seeds_url {
            config.topology.seeds_url = url;
        }
        if let Some(cassandra) = self.cassandra {
            config.cassandra = cassandra;
        }
        if let Some(executor) = self.executor {
            config.executor = executor;
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: ManagerPhase,
    failure: Option<String>,
    namespace: Option<String>,
    snapshot: Option<Arc<ConfigSnapshot>>,
}

/// Owner of the persisted configuration record set of one cluster.
///
/// One instance per process, shared by reference. Accessors never touch
/// the network and never wait on the gate: they clone the snapshot `Arc`
/// under a `std::sync::RwLock` whose write side is only held to swap that
/// pointer or the phase, never across an `.await`. `start`, `update`,
/// `resync`, `teardown` and `stop` are serialized through the gate; a
/// second concurrent update fails fast with `UpdateInProgress`.
#[derive(Debug)]
pub struct ConfigurationManager {
    session: Session,
    options: ManagerOptions,
    inner: RwLock<Inner>,
    gate: Mutex<()>,
}

impl ConfigurationManager {
    pub fn new(session: Session) -> Self {
        Self::with_options(session, ManagerOptions::default())
    }

    pub fn with_options(session: Session, options: ManagerOptions) -> Self {
        Self {
            session,
            options,
            inner: RwLock::new(Inner {
                phase: ManagerPhase::Uninitialized,
                failure: None,
                namespace: None,
                snapshot: None,
            }),
            gate: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> ManagerPhase {
        self.read_inner().phase
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Liveness of the underlying store session.
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Bring the manager to `Ready` from the store contents, writing
    /// `defaults` where records are missing.
    pub async fn start(&self, defaults: ClusterConfiguration) -> ConfigResult<Arc<ConfigSnapshot>> {
        let _gate = self.gate.try_lock().map_err(|_| ConfigError::IllegalTransition {
            op: "start",
            phase: self.phase(),
        })?;
        let phase = self.phase();
        if phase != ManagerPhase::Uninitialized {
            return Err(ConfigError::IllegalTransition { op: "start", phase });
        }
        defaults
            .validate()
            .map_err(|e| ConfigError::InvalidConfiguration(e.to_string()))?;

        let namespace = records::namespace(&defaults.identity.name);
        self.write_inner().namespace = Some(namespace.clone());
        info!(%namespace, "starting configuration manager");

        match self.bootstrap(&namespace, &defaults).await {
            Ok(snapshot) => Ok(self.become_ready(snapshot)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Release the store session. Records stay in place and the manager
    /// cannot be started again.
    pub async fn stop(&self) -> ConfigResult<()> {
        let _gate = self.gate.lock().await;
        if self.phase() == ManagerPhase::Stopped {
            return Ok(());
        }
        self.set_phase(ManagerPhase::Stopped);
        self.write_inner().snapshot = None;
        self.session.close().await?;
        Ok(())
    }

    /// Reconnect the store session and reload the full record set.
    ///
    /// Required after `SessionExpired` or an ambiguous update, since
    /// another instance may have written in the meantime.
    pub async fn resync(&self) -> ConfigResult<Arc<ConfigSnapshot>> {
        let _gate = self.gate.lock().await;
        let current = self.ready_snapshot()?;
        let namespace = self.namespace()?;

        self.session.reconnect().await?;
        let present = self.read_set(&namespace).await?;
        match decode_complete(&current.config, &present) {
            Ok(snapshot) => {
                let snapshot = self.swap_snapshot(snapshot);
                info!(%namespace, "configuration resynchronized from store");
                Ok(snapshot)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Ping the store so an idle session notices an outage, and stays
    /// current while there is none. Does not take the gate.
    pub async fn heartbeat(&self) -> ConfigResult<()> {
        self.session.heartbeat().await?;
        Ok(())
    }

    /// Delete every record of the set and stop. Used when the cluster
    /// itself is being removed.
    pub async fn teardown(&self) -> ConfigResult<()> {
        let _gate = self.gate.try_lock().map_err(|_| ConfigError::UpdateInProgress)?;
        let current = self.current()?;
        let namespace = self.namespace()?;

        let ops = RecordKey::ALL
            .into_iter()
            .map(|key| StoreOp::delete(key.path(&namespace), current.version(key)))
            .collect();
        self.session
            .write_batch(ops)
            .await
            .map_err(|e| concurrent_or_store("teardown", e))?;
        warn!(%namespace, "configuration record set deleted");

        self.set_phase(ManagerPhase::Stopped);
        self.write_inner().snapshot = None;
        self.session.close().await?;
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ConfigResult<Arc<ConfigSnapshot>> {
        self.current()
    }

    pub fn servers(&self) -> ConfigResult<u32> {
        Ok(self.current()?.config.topology.servers)
    }

    pub fn seeds(&self) -> ConfigResult<u32> {
        Ok(self.current()?.config.topology.seeds)
    }

    pub fn cassandra_config(&self) -> ConfigResult<CassandraConfig> {
        Ok(self.current()?.config.cassandra.clone())
    }

    pub fn executor_config(&self) -> ConfigResult<ExecutorConfig> {
        Ok(self.current()?.config.executor.clone())
    }

    pub fn identity(&self) -> ConfigResult<Identity> {
        Ok(self.current()?.config.identity.clone())
    }

    pub fn placement_strategy(&self) -> ConfigResult<PlacementStrategy> {
        Ok(self.current()?.config.topology.placement)
    }

    pub fn seeds_url(&self) -> ConfigResult<String> {
        Ok(self.current()?.config.topology.seeds_url.clone())
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Apply `update` to the store and the cached snapshot.
    ///
    /// Every changed record is written in one batch guarded by the version
    /// this instance last read. On a timeout or lost connection the batch
    /// may still have committed; call `resync` before retrying.
    pub async fn update(&self, update: ConfigurationUpdate) -> ConfigResult<Arc<ConfigSnapshot>> {
        self.commit("update", |config| {
            update.apply_to(config);
            Ok(())
        })
        .await
    }

    /// Persist the framework id assigned at first registration. Repeating
    /// the same id is a no-op; a different id is rejected.
    pub async fn register_framework_id(&self, id: &str) -> ConfigResult<Arc<ConfigSnapshot>> {
        self.commit("register framework id", |config| {
            match config.identity.id.clone() {
                Some(existing) if existing == id => Ok(()),
                Some(existing) => Err(ConfigError::InvalidConfiguration(format!(
                    "framework already registered with id {existing:?}"
                ))),
                None => {
                    config.identity = config.identity.with_id(id);
                    Ok(())
                }
            }
        })
        .await
    }

    async fn commit<F>(&self, op: &'static str, change: F) -> ConfigResult<Arc<ConfigSnapshot>>
    where
        F: FnOnce(&mut ClusterConfiguration) -> ConfigResult<()>,
    {
        let _gate = self.gate.try_lock().map_err(|_| ConfigError::UpdateInProgress)?;
        let current = self.current()?;
        let namespace = self.namespace()?;

        let mut target = current.config.clone();
        change(&mut target)?;
        target
            .validate()
            .map_err(|e| ConfigError::InvalidConfiguration(e.to_string()))?;

        let mut changed = Vec::new();
        let mut ops = Vec::new();
        for key in RecordKey::ALL {
            let value = encode(key, &target)?;
            if value == encode(key, &current.config)? {
                continue;
            }
            let expected = current
                .version(key)
                .map_or(ExpectedVersion::Absent, ExpectedVersion::Exact);
            ops.push(StoreOp::write(key.path(&namespace), value, expected));
            changed.push(key);
        }
        if ops.is_empty() {
            debug!(op, "no record changed");
            return Ok(current);
        }

        let versions = self
            .session
            .write_batch(ops)
            .await
            .map_err(|e| concurrent_or_store(op, e))?;

        let mut next = ConfigSnapshot {
            config: target,
            versions: current.versions.clone(),
        };
        for (key, version) in changed.iter().zip(versions) {
            next.versions.insert(*key, version);
        }
        let next = self.swap_snapshot(next);
        info!(op, records = ?changed, "configuration updated");
        Ok(next)
    }

    // ── Startup ───────────────────────────────────────────────────

    async fn bootstrap(&self, namespace: &str, defaults: &ClusterConfiguration) -> ConfigResult<ConfigSnapshot> {
        let present = self.read_set(namespace).await?;
        if present.is_empty() {
            self.set_phase(ManagerPhase::Initializing);
            return self.initialize(namespace, defaults).await;
        }

        self.set_phase(ManagerPhase::Recovering);
        if is_complete(&present) {
            return decode_complete(defaults, &present);
        }
        warn!(
            present = ?present.keys().collect::<Vec<_>>(),
            missing = ?records::missing(&present),
            "partial record set, waiting for a concurrent initializer"
        );
        let present = self.converge(namespace, present).await?;
        self.finish(namespace, defaults, present).await
    }

    /// Create every record from `defaults`, identity first. Losing the
    /// race for any record hands the set over to whoever won it.
    async fn initialize(&self, namespace: &str, defaults: &ClusterConfiguration) -> ConfigResult<ConfigSnapshot> {
        for key in RecordKey::ALL {
            let path = key.path(namespace);
            match self.session.create_if_absent(&path, encode(key, defaults)?).await {
                Ok(version) => debug!(key = %path, version, "record created"),
                Err(StoreError::AlreadyExists { .. }) => {
                    warn!(key = %path, "lost initialization race, converging on the winner's records");
                    let present = self.read_set(namespace).await?;
                    let present = self.converge(namespace, present).await?;
                    return self.finish(namespace, defaults, present).await;
                }
                Err(e) if e.is_ambiguous() => {
                    warn!(key = %path, error = %e, "initial write outcome unknown, re-reading record set");
                    let present = self.read_set(namespace).await?;
                    let present = self.converge(namespace, present).await?;
                    return self.finish(namespace, defaults, present).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let present = self.read_set(namespace).await?;
        decode_complete(defaults, &present)
    }

    /// Poll until the set is complete or the convergence timeout passes.
    async fn converge(&self, namespace: &str, mut present: RecordSet) -> ConfigResult<RecordSet> {
        let deadline = Instant::now() + self.options.convergence_timeout;
        while !is_complete(&present) && Instant::now() < deadline {
            tokio::time::sleep(self.options.poll_interval).await;
            present = self.read_set(namespace).await?;
        }
        if !is_complete(&present) {
            warn!(
                missing = ?records::missing(&present),
                timeout = ?self.options.convergence_timeout,
                "record set still incomplete"
            );
        }
        Ok(present)
    }

    async fn finish(
        &self,
        namespace: &str,
        defaults: &ClusterConfiguration,
        present: RecordSet,
    ) -> ConfigResult<ConfigSnapshot> {
        if is_complete(&present) {
            decode_complete(defaults, &present)
        } else {
            self.repair(namespace, defaults, present).await
        }
    }

    /// Fill in the records missing from `present`. Stored values win over
    /// `defaults`; the combination must still validate.
    async fn repair(
        &self,
        namespace: &str,
        defaults: &ClusterConfiguration,
        present: RecordSet,
    ) -> ConfigResult<ConfigSnapshot> {
        let composed = records::compose(defaults, &present)?;
        check_identity(defaults, &composed)?;
        composed.validate().map_err(|e| {
            ConfigError::Inconsistent(format!("stored records contradict defaults: {e}"))
        })?;

        let missing = records::missing(&present);
        info!(?missing, "repairing partial record set from defaults");
        for key in missing {
            let path = key.path(namespace);
            match self.session.create_if_absent(&path, encode(key, &composed)?).await {
                Ok(version) => debug!(key = %path, version, "missing record created"),
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!(key = %path, "missing record written by another instance")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let present = self.read_set(namespace).await?;
        decode_complete(defaults, &present)
    }

    async fn read_set(&self, namespace: &str) -> ConfigResult<RecordSet> {
        let mut set = RecordSet::new();
        for key in RecordKey::ALL {
            if let Some(record) = self.session.read(&key.path(namespace)).await? {
                set.insert(key, record);
            }
        }
        Ok(set)
    }

    // ── State ─────────────────────────────────────────────────────

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: ManagerPhase) {
        let mut inner = self.write_inner();
        let from = inner.phase;
        inner.phase = phase;
        info!(%from, to = %phase, "configuration manager phase changed");
    }

    fn become_ready(&self, snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        let snapshot = self.swap_snapshot(snapshot);
        self.set_phase(ManagerPhase::Ready);
        snapshot
    }

    fn swap_snapshot(&self, snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.write_inner().snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn fail(&self, err: ConfigError) -> ConfigError {
        error!(error = %err, "configuration manager failed");
        let mut inner = self.write_inner();
        inner.phase = ManagerPhase::Failed;
        inner.failure = Some(err.to_string());
        inner.snapshot = None;
        err
    }

    /// The cached snapshot, provided the manager is `Ready`.
    fn ready_snapshot(&self) -> ConfigResult<Arc<ConfigSnapshot>> {
        let inner = self.read_inner();
        match (inner.phase, &inner.snapshot) {
            (ManagerPhase::Ready, Some(snapshot)) => Ok(Arc::clone(snapshot)),
            (ManagerPhase::Failed, _) => Err(ConfigError::Failed(
                inner.failure.clone().unwrap_or_default(),
            )),
            (phase, _) => Err(ConfigError::NotReady { phase }),
        }
    }

    /// Like `ready_snapshot`, but refuses to serve a cache that outlived
    /// its session.
    fn current(&self) -> ConfigResult<Arc<ConfigSnapshot>> {
        let snapshot = self.ready_snapshot()?;
        if self.session.state() == SessionState::Expired {
            return Err(StoreError::SessionExpired.into());
        }
        Ok(snapshot)
    }

    fn namespace(&self) -> ConfigResult<String> {
        let inner = self.read_inner();
        inner
            .namespace
            .clone()
            .ok_or(ConfigError::NotReady { phase: inner.phase })
    }
}

fn encode(key: RecordKey, config: &ClusterConfiguration) -> ConfigResult<Vec<u8>> {
    key.encode(config)
        .map_err(|e| ConfigError::InvalidConfiguration(format!("{key}: {e}")))
}

fn is_complete(present: &RecordSet) -> bool {
    present.len() == RecordKey::ALL.len()
}

fn check_identity(defaults: &ClusterConfiguration, stored: &ClusterConfiguration) -> ConfigResult<()> {
    if stored.identity.name != defaults.identity.name {
        return Err(ConfigError::Inconsistent(format!(
            "stored identity {:?} does not match framework {:?}",
            stored.identity.name, defaults.identity.name
        )));
    }
    Ok(())
}

/// Decode a full record set on top of `base`.
fn decode_complete(base: &ClusterConfiguration, present: &RecordSet) -> ConfigResult<ConfigSnapshot> {
    let missing = records::missing(present);
    if !missing.is_empty() {
        return Err(ConfigError::Inconsistent(format!(
            "records {missing:?} missing from the store"
        )));
    }
    let config = records::compose(base, present)?;
    check_identity(base, &config)?;
    config
        .validate()
        .map_err(|e| ConfigError::Inconsistent(e.to_string()))?;
    Ok(ConfigSnapshot {
        config,
        versions: records::versions(present),
    })
}

/// CAS rejections mean another writer got in between.
fn concurrent_or_store(op: &'static str, err: StoreError) -> ConfigError {
    match err {
        StoreError::VersionConflict { key, .. }
        | StoreError::AlreadyExists { key, .. }
        | StoreError::NotFound(key) => {
            warn!(op, %key, "record modified by another writer");
            ConfigError::ConcurrentModification { key }
        }
        other => {
            if other.is_ambiguous() {
                warn!(op, error = %other, "outcome unknown, resync before retrying");
            }
            other.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{TestBackend, defaults, session_for, test_options};
    use cassandra_core::Serializer;
    use cassandra_state::RecordStore;

    async fn manager_on(store: &RecordStore) -> (ConfigurationManager, Arc<TestBackend>) {
        let backend = Arc::new(TestBackend::new(store.clone()));
        let session = session_for(Arc::clone(&backend)).await;
        (ConfigurationManager::with_options(session, test_options()), backend)
    }

    fn value(store: &RecordStore, key: &str) -> (Vec<u8>, Version) {
        let record = store.get(key).unwrap().unwrap();
        (record.value, record.version)
    }

    #[tokio::test]
    async fn first_start_writes_defaults() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;

        manager.start(defaults()).await.unwrap();
        assert_eq!(manager.phase(), ManagerPhase::Ready);
        assert_eq!(manager.servers().unwrap(), 3);
        assert_eq!(manager.seeds().unwrap(), 2);
        assert_eq!(manager.cassandra_config().unwrap(), defaults().cassandra);
        assert_eq!(manager.placement_strategy().unwrap(), PlacementStrategy::Node);

        let (bytes, version) = value(&store, "/cassandra/cassandra-config");
        assert_eq!(version, 0);
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json.get("replaceIp").is_none());
        assert_eq!(json["version"], "2.2.5");
        assert_eq!(value(&store, "/cassandra/servers").0, b"3");
        assert_eq!(store.records().unwrap().len(), RecordKey::ALL.len());
        assert!(manager.snapshot().unwrap().versions.values().all(|v| *v == 0));
    }

    #[tokio::test]
    async fn restart_recovers_stored_values() {
        let store = RecordStore::open_in_memory().unwrap();
        let (first, _) = manager_on(&store).await;
        let before = first.start(defaults()).await.unwrap();
        first.stop().await.unwrap();
        assert_eq!(first.phase(), ManagerPhase::Stopped);

        let mut changed = defaults();
        changed.topology.servers = 7;
        let (second, _) = manager_on(&store).await;
        let after = second.start(changed).await.unwrap();

        assert_eq!(after.config, before.config);
        assert_eq!(after.versions, before.versions);
        assert_eq!(second.servers().unwrap(), 3);
    }

    #[tokio::test]
    async fn racing_initializers_agree_on_one_record_set() {
        let store = RecordStore::open_in_memory().unwrap();
        let (a, _) = manager_on(&store).await;
        let (b, _) = manager_on(&store).await;

        let mut other = defaults();
        other.topology.servers = 5;
        other.topology.seeds = 1;
        other.cassandra.cpus = 1.0;

        let (ra, rb) = tokio::join!(a.start(defaults()), b.start(other.clone()));
        let (sa, sb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(sa.config, sb.config);
        assert!(sa.config == defaults() || sa.config == other);
        assert!(store.records().unwrap().iter().all(|(_, r)| r.version == 0));
    }

    #[tokio::test]
    async fn timed_out_first_write_waits_for_the_other_initializer() {
        let store = RecordStore::open_in_memory().unwrap();
        let options = ManagerOptions {
            convergence_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        };
        let slow_backend = Arc::new(TestBackend::new(store.clone()));
        let winner_backend = Arc::new(TestBackend::new(store.clone()));
        let slow = ConfigurationManager::with_options(session_for(Arc::clone(&slow_backend)).await, options);
        let winner =
            ConfigurationManager::with_options(session_for(Arc::clone(&winner_backend)).await, options);

        // The slow instance's identity write outlives its operation timeout
        // while the winner is still part way through its own set.
        slow_backend.set_apply_delay(Duration::from_millis(400));
        winner_backend.set_apply_delay(Duration::from_millis(80));

        let mut other = defaults();
        other.topology.servers = 5;
        other.topology.seeds = 1;
        other.cassandra.cpus = 1.0;

        let (rs, rw) = tokio::join!(slow.start(defaults()), winner.start(other.clone()));
        let (ss, sw) = (rs.unwrap(), rw.unwrap());

        assert_eq!(sw.config, other);
        assert_eq!(ss.config, other);
        assert_eq!(value(&store, "/cassandra/servers").0, b"5");
        assert_eq!(value(&store, "/cassandra/seeds").0, b"1");
        assert!(store.records().unwrap().iter().all(|(_, r)| r.version == 0));
    }

    #[tokio::test]
    async fn partial_set_is_completed_from_defaults() {
        let store = RecordStore::open_in_memory().unwrap();
        let identity = Identity::JSON_SERIALIZER
            .serialize(&defaults().identity)
            .unwrap();
        store
            .apply_batch(&[
                StoreOp::create("/cassandra/identity", identity),
                StoreOp::create("/cassandra/servers", b"5".to_vec()),
            ])
            .unwrap();

        let (manager, _) = manager_on(&store).await;
        let snapshot = manager.start(defaults()).await.unwrap();

        assert_eq!(manager.servers().unwrap(), 5);
        assert_eq!(manager.seeds().unwrap(), 2);
        assert_eq!(manager.cassandra_config().unwrap(), defaults().cassandra);
        assert_eq!(manager.executor_config().unwrap(), defaults().executor);
        assert_eq!(manager.identity().unwrap(), defaults().identity);
        assert_eq!(value(&store, "/cassandra/servers"), (b"5".to_vec(), 0));
        assert_eq!(snapshot.version(RecordKey::Identity), Some(0));
        assert_eq!(store.records().unwrap().len(), RecordKey::ALL.len());
    }

    #[tokio::test]
    async fn partial_set_of_another_framework_fails() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut foreign = defaults().identity;
        foreign.name = "elsewhere".to_string();
        store
            .apply_batch(&[StoreOp::create(
                "/cassandra/identity",
                Identity::JSON_SERIALIZER.serialize(&foreign).unwrap(),
            )])
            .unwrap();

        let (manager, _) = manager_on(&store).await;
        let err = manager.start(defaults()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
        assert_eq!(manager.phase(), ManagerPhase::Failed);
        assert!(matches!(manager.servers(), Err(ConfigError::Failed(_))));
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_set_contradicting_defaults_fails() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .apply_batch(&[StoreOp::create("/cassandra/servers", b"1".to_vec())])
            .unwrap();

        // Default seeds (2) cannot exceed the stored server count.
        let (manager, _) = manager_on(&store).await;
        let err = manager.start(defaults()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
        assert_eq!(manager.phase(), ManagerPhase::Failed);
    }

    #[tokio::test]
    async fn malformed_record_fails_the_manager() {
        let store = RecordStore::open_in_memory().unwrap();
        let (first, _) = manager_on(&store).await;
        first.start(defaults()).await.unwrap();
        first.stop().await.unwrap();
        store
            .apply_batch(&[StoreOp::write(
                "/cassandra/servers",
                b"three".to_vec(),
                ExpectedVersion::Exact(0),
            )])
            .unwrap();

        let (manager, _) = manager_on(&store).await;
        let err = manager.start(defaults()).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MalformedRecord {
                key: RecordKey::Servers,
                ..
            }
        ));
        assert_eq!(manager.phase(), ManagerPhase::Failed);
        assert!(matches!(
            manager.update(ConfigurationUpdate::new().servers(4)).await,
            Err(ConfigError::Failed(_))
        ));
        // Left for the operator.
        assert_eq!(value(&store, "/cassandra/servers"), (b"three".to_vec(), 1));
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrent_modification() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();

        store
            .apply_batch(&[StoreOp::write(
                "/cassandra/seeds",
                b"1".to_vec(),
                ExpectedVersion::Exact(0),
            )])
            .unwrap();

        let err = manager
            .update(ConfigurationUpdate::new().seeds(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConcurrentModification { ref key } if key == "/cassandra/seeds"));
        assert_eq!(value(&store, "/cassandra/seeds"), (b"1".to_vec(), 1));
        assert_eq!(manager.seeds().unwrap(), 2);

        manager.resync().await.unwrap();
        assert_eq!(manager.seeds().unwrap(), 1);
        manager.update(ConfigurationUpdate::new().seeds(3)).await.unwrap();
        assert_eq!(value(&store, "/cassandra/seeds"), (b"3".to_vec(), 2));
        assert_eq!(manager.seeds().unwrap(), 3);
    }

    #[tokio::test]
    async fn multi_record_update_is_one_batch() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        let applies = backend.applies.load(Ordering::SeqCst);

        let snapshot = manager
            .update(ConfigurationUpdate::new().servers(5).seeds(3))
            .await
            .unwrap();

        assert_eq!(backend.applies.load(Ordering::SeqCst), applies + 1);
        assert_eq!(snapshot.version(RecordKey::Servers), Some(1));
        assert_eq!(snapshot.version(RecordKey::Seeds), Some(1));
        assert_eq!(snapshot.version(RecordKey::CassandraConfig), Some(0));
        assert_eq!(value(&store, "/cassandra/servers"), (b"5".to_vec(), 1));
        assert_eq!(value(&store, "/cassandra/seeds"), (b"3".to_vec(), 1));
        assert_eq!(*manager.snapshot().unwrap(), *snapshot);
    }

    #[tokio::test]
    async fn unchanged_update_writes_nothing() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        let applies = backend.applies.load(Ordering::SeqCst);

        manager
            .update(ConfigurationUpdate::new().servers(3))
            .await
            .unwrap();
        assert_eq!(backend.applies.load(Ordering::SeqCst), applies);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_before_writing() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        let applies = backend.applies.load(Ordering::SeqCst);

        let err = manager
            .update(ConfigurationUpdate::new().seeds(9))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
        assert_eq!(backend.applies.load(Ordering::SeqCst), applies);
        assert_eq!(manager.seeds().unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_update_fails_fast() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        backend.set_apply_delay(Duration::from_millis(100));

        let (first, second) = tokio::join!(
            manager.update(ConfigurationUpdate::new().servers(4)),
            manager.update(ConfigurationUpdate::new().servers(5)),
        );
        assert_eq!(first.unwrap().config.topology.servers, 4);
        assert_eq!(second.unwrap_err(), ConfigError::UpdateInProgress);
        assert_eq!(manager.servers().unwrap(), 4);
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_an_update_in_flight() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        backend.set_apply_delay(Duration::from_millis(200));

        let reader = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let started = Instant::now();
            let servers = manager.servers().unwrap();
            let snapshot = manager.snapshot().unwrap();
            (servers, snapshot, started.elapsed())
        };
        let (updated, (servers, snapshot, waited)) =
            tokio::join!(manager.update(ConfigurationUpdate::new().servers(4)), reader);

        assert_eq!(servers, 3);
        assert_eq!(snapshot.config.topology.servers, 3);
        assert!(waited < Duration::from_millis(50), "reader waited {waited:?}");
        assert_eq!(updated.unwrap().config.topology.servers, 4);
        assert_eq!(manager.servers().unwrap(), 4);
    }

    #[tokio::test]
    async fn timed_out_update_is_seen_after_resync() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        backend.set_ack_delay(Duration::from_secs(1));

        let err = manager
            .update(ConfigurationUpdate::new().servers(4))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Store(StoreError::Timeout { .. })));
        assert_eq!(manager.servers().unwrap(), 3);
        assert_eq!(value(&store, "/cassandra/servers"), (b"4".to_vec(), 1));

        // Retrying with the version read before the timeout cannot apply twice.
        let err = manager
            .update(ConfigurationUpdate::new().servers(4))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConcurrentModification { .. }));

        backend.set_ack_delay(Duration::ZERO);
        let snapshot = manager.resync().await.unwrap();
        assert_eq!(snapshot.config.topology.servers, 4);
        assert_eq!(snapshot.version(RecordKey::Servers), Some(1));
    }

    #[tokio::test]
    async fn expired_session_needs_resync() {
        let store = RecordStore::open_in_memory().unwrap();
        let backend = Arc::new(TestBackend::new(store.clone()));
        let mut settings = crate::test_support::settings();
        settings.session_timeout = Duration::from_millis(200);
        let session = Session::connect(Arc::clone(&backend) as Arc<dyn cassandra_state::Backend>, settings)
            .await
            .unwrap();
        let manager = ConfigurationManager::with_options(session, test_options());
        manager.start(defaults()).await.unwrap();

        backend.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.heartbeat().await.unwrap_err(),
            ConfigError::Store(StoreError::Unreachable(_))
        ));
        assert_eq!(manager.servers().unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let err = manager
            .update(ConfigurationUpdate::new().servers(4))
            .await
            .unwrap_err();
        assert_eq!(err, ConfigError::Store(StoreError::SessionExpired));
        assert_eq!(manager.session_state(), SessionState::Expired);
        assert_eq!(
            manager.servers().unwrap_err(),
            ConfigError::Store(StoreError::SessionExpired)
        );

        // Another instance wrote while this one was cut off.
        store
            .apply_batch(&[StoreOp::write(
                "/cassandra/servers",
                b"6".to_vec(),
                ExpectedVersion::Exact(0),
            )])
            .unwrap();
        backend.down.store(false, Ordering::SeqCst);

        manager.resync().await.unwrap();
        assert_eq!(manager.session_state(), SessionState::Connected);
        assert_eq!(manager.servers().unwrap(), 6);
    }

    #[tokio::test]
    async fn framework_id_is_assigned_once() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, backend) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();

        manager.register_framework_id("fw-0001").await.unwrap();
        assert_eq!(manager.identity().unwrap().id.as_deref(), Some("fw-0001"));
        let (bytes, version) = value(&store, "/cassandra/identity");
        assert_eq!(version, 1);
        let stored = Identity::JSON_SERIALIZER.deserialize(&bytes).unwrap();
        assert_eq!(stored.id.as_deref(), Some("fw-0001"));

        let applies = backend.applies.load(Ordering::SeqCst);
        manager.register_framework_id("fw-0001").await.unwrap();
        assert_eq!(backend.applies.load(Ordering::SeqCst), applies);

        let err = manager.register_framework_id("fw-0002").await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn teardown_deletes_every_record() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();

        manager.teardown().await.unwrap();
        assert!(store.records().unwrap().is_empty());
        assert_eq!(manager.phase(), ManagerPhase::Stopped);
        assert_eq!(
            manager.servers().unwrap_err(),
            ConfigError::NotReady {
                phase: ManagerPhase::Stopped
            }
        );
    }

    #[tokio::test]
    async fn teardown_refuses_when_records_moved_on() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        store
            .apply_batch(&[StoreOp::write(
                "/cassandra/seeds",
                b"1".to_vec(),
                ExpectedVersion::Exact(0),
            )])
            .unwrap();

        let err = manager.teardown().await.unwrap_err();
        assert!(matches!(err, ConfigError::ConcurrentModification { .. }));
        assert_eq!(store.records().unwrap().len(), RecordKey::ALL.len());
        assert_eq!(manager.phase(), ManagerPhase::Ready);
    }

    #[tokio::test]
    async fn stopped_manager_keeps_records_and_cannot_restart() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        manager.start(defaults()).await.unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(store.records().unwrap().len(), RecordKey::ALL.len());
        assert_eq!(
            manager.start(defaults()).await.unwrap_err(),
            ConfigError::IllegalTransition {
                op: "start",
                phase: ManagerPhase::Stopped
            }
        );
    }

    #[tokio::test]
    async fn accessors_before_start_are_not_ready() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        let not_ready = ConfigError::NotReady {
            phase: ManagerPhase::Uninitialized,
        };
        assert_eq!(manager.servers().unwrap_err(), not_ready);
        assert_eq!(manager.identity().unwrap_err(), not_ready);
        assert_eq!(
            manager.update(ConfigurationUpdate::new().servers(4)).await.unwrap_err(),
            not_ready
        );
    }

    #[tokio::test]
    async fn invalid_defaults_are_rejected_without_writing() {
        let store = RecordStore::open_in_memory().unwrap();
        let (manager, _) = manager_on(&store).await;
        let mut bad = defaults();
        bad.topology.seeds = 4;

        let err = manager.start(bad).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
        assert_eq!(manager.phase(), ManagerPhase::Uninitialized);
        assert!(store.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn root_path_prefixes_every_record() {
        let store = RecordStore::open_in_memory().unwrap();
        let backend = Arc::new(TestBackend::new(store.clone()));
        let mut settings = crate::test_support::settings();
        settings.root_path = Some("/mesos".to_string());
        let session = Session::connect(backend, settings).await.unwrap();
        let manager = ConfigurationManager::with_options(session, test_options());

        manager.start(defaults()).await.unwrap();
        assert_eq!(value(&store, "/mesos/cassandra/seeds").0, b"2");
        assert!(store.get("/cassandra/seeds").unwrap().is_none());
    }
}
