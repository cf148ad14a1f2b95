//! Consensus store integration tests.
//!
//! Runs a single-member store node over real TCP and drives configuration
//! managers against it through `ConsensusClient` sessions.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use cassandra_config::{ConfigurationManager, ConfigurationUpdate, ManagerPhase};
use cassandra_core::{ClusterConfiguration, SchedulerConfig};
use cassandra_raft::StoreNode;
use cassandra_state::SessionSettings;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::ServiceExt;

const SAMPLE: &str = include_str!("../config/scheduler.toml");

struct RunningNode {
    node: Arc<StoreNode>,
    addr: String,
    stop: oneshot::Sender<()>,
    _dir: tempfile::TempDir,
}

impl RunningNode {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.node.shutdown().await.unwrap();
    }
}

async fn spawn_node() -> RunningNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let dir = tempfile::tempdir().unwrap();
    let node = StoreNode::open(1, addr.clone(), dir.path()).await.unwrap();
    node.initialize().await.unwrap();
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(cassandra_raft::server::serve(
        Arc::clone(&node),
        listener,
        async move {
            let _ = stopped.await;
        },
    ));
    RunningNode {
        node,
        addr,
        stop,
        _dir: dir,
    }
}

fn defaults() -> ClusterConfiguration {
    SchedulerConfig::parse(SAMPLE, |_| None)
        .unwrap()
        .defaults()
        .unwrap()
}

async fn manager_for(addr: &str) -> ConfigurationManager {
    let settings = SessionSettings {
        endpoints: vec![addr.to_string()],
        connection_timeout: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(5),
        retry_backoff: Duration::from_millis(50),
        ..SessionSettings::default()
    };
    let session = cassandra_raft::connect(settings).await.unwrap();
    ConfigurationManager::new(session)
}

#[tokio::test]
async fn manager_initializes_and_recovers_through_consensus() {
    let running = spawn_node().await;

    let first = manager_for(&running.addr).await;
    first.start(defaults()).await.unwrap();
    assert_eq!(first.servers().unwrap(), 3);
    first
        .update(ConfigurationUpdate::new().servers(4))
        .await
        .unwrap();
    first.stop().await.unwrap();

    let second = manager_for(&running.addr).await;
    let snapshot = second.start(defaults()).await.unwrap();
    assert_eq!(second.phase(), ManagerPhase::Ready);
    assert_eq!(snapshot.config.topology.servers, 4);
    assert_eq!(snapshot.config.topology.seeds, 2);

    second.stop().await.unwrap();
    running.shutdown().await;
}

#[tokio::test]
async fn racing_managers_converge_through_consensus() {
    let running = spawn_node().await;
    let a = manager_for(&running.addr).await;
    let b = manager_for(&running.addr).await;

    let mut other = defaults();
    other.topology.servers = 7;
    other.topology.seeds = 3;

    let (ra, rb) = tokio::join!(a.start(defaults()), b.start(other.clone()));
    let (sa, sb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(sa.config, sb.config);
    assert!(sa.config == defaults() || sa.config == other);

    running.shutdown().await;
}

#[tokio::test]
async fn stale_writer_is_rejected_by_consensus() {
    let running = spawn_node().await;
    let a = manager_for(&running.addr).await;
    let b = manager_for(&running.addr).await;
    a.start(defaults()).await.unwrap();
    b.start(defaults()).await.unwrap();

    a.update(ConfigurationUpdate::new().seeds(3)).await.unwrap();
    let err = b
        .update(ConfigurationUpdate::new().seeds(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        cassandra_config::ConfigError::ConcurrentModification { .. }
    ));

    b.resync().await.unwrap();
    assert_eq!(b.seeds().unwrap(), 3);

    running.shutdown().await;
}

#[tokio::test]
async fn api_over_consensus_backed_manager() {
    let running = spawn_node().await;
    let manager = Arc::new(manager_for(&running.addr).await);
    manager.start(defaults()).await.unwrap();

    let router = cassandra_api::build_router(Arc::clone(&manager));
    let req = Request::builder()
        .uri("/v1/config/seeds")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"2");

    running.shutdown().await;
}
