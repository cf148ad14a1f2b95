//! Fixtures shared by the manager tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cassandra_core::{
    CassandraConfig, ClusterConfiguration, ClusterTopology, DEFAULT_FAILOVER_TIMEOUT_SECS,
    DEFAULT_JMX_PORT, ExecutorConfig, Identity, PlacementStrategy,
};
use cassandra_state::{
    Backend, RecordStore, Session, SessionSettings, StoreError, StoreOp, StoreResult, Version,
    VersionedRecord,
};

use crate::manager::ManagerOptions;

/// servers=3, seeds=2, Cassandra 2.2.5 at 0.5 cpus / 4096 MB / 10240 MB.
pub(crate) fn defaults() -> ClusterConfiguration {
    ClusterConfiguration {
        identity: Identity {
            name: "cassandra".to_string(),
            id: None,
            role: "cassandra_role".to_string(),
            principal: "cassandra_principal".to_string(),
            secret: None,
            failover_timeout_secs: DEFAULT_FAILOVER_TIMEOUT_SECS,
            checkpoint: true,
        },
        cassandra: CassandraConfig {
            version: "2.2.5".to_string(),
            cpus: 0.5,
            memory_mb: 4096,
            disk_mb: 10240,
            jmx_port: DEFAULT_JMX_PORT,
            replace_ip: None,
        },
        executor: ExecutorConfig {
            command: "executor/bin/cassandra-executor".to_string(),
            arguments: Vec::new(),
            cpus: 0.1,
            memory_mb: 768,
            disk_mb: 1024,
            heap_mb: 512,
            api_port: 9001,
            uris: Vec::new(),
            java_home: None,
        },
        topology: ClusterTopology {
            servers: 3,
            seeds: 2,
            placement: PlacementStrategy::Node,
            seeds_url: "http://scheduler.cassandra.mesos:9000/v1/seeds".to_string(),
        },
    }
}

pub(crate) fn settings() -> SessionSettings {
    SessionSettings {
        endpoints: vec!["memory".to_string()],
        session_timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_millis(500),
        operation_timeout: Duration::from_millis(300),
        retry_backoff: Duration::from_millis(10),
        root_path: None,
    }
}

pub(crate) fn test_options() -> ManagerOptions {
    ManagerOptions {
        convergence_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    }
}

pub(crate) async fn session_for(backend: Arc<TestBackend>) -> Session {
    Session::connect(backend, settings()).await.unwrap()
}

/// A `RecordStore` that yields before every call, so concurrent managers
/// interleave, and can be switched off or slowed down.
pub(crate) struct TestBackend {
    store: RecordStore,
    pub down: AtomicBool,
    pub applies: AtomicU32,
    apply_delay_ms: AtomicU64,
    ack_delay_ms: AtomicU64,
}

impl TestBackend {
    pub(crate) fn new(store: RecordStore) -> Self {
        Self {
            store,
            down: AtomicBool::new(false),
            applies: AtomicU32::new(0),
            apply_delay_ms: AtomicU64::new(0),
            ack_delay_ms: AtomicU64::new(0),
        }
    }

    /// Delay before a batch is applied.
    pub(crate) fn set_apply_delay(&self, delay: Duration) {
        self.apply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay between committing a batch and acknowledging it. Rejected
    /// batches are acknowledged at once.
    pub(crate) fn set_ack_delay(&self, delay: Duration) {
        self.ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn enter(&self) -> StoreResult<()> {
        tokio::task::yield_now().await;
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("test backend down".to_string()));
        }
        Ok(())
    }
}

async fn pause(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl Backend for TestBackend {
    async fn ping(&self) -> StoreResult<()> {
        self.enter().await
    }

    async fn read(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        self.enter().await?;
        self.store.get(key)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<Version>> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        pause(&self.apply_delay_ms).await;
        let outcome = self.store.apply_batch(&ops);
        if outcome.is_ok() {
            pause(&self.ack_delay_ms).await;
        }
        outcome
    }
}
