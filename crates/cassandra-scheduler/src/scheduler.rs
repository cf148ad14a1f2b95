//! Scheduler mode — the configuration manager and its REST API.
//!
//! In this mode, the daemon:
//! 1. Loads scheduler.toml and builds the configuration defaults
//! 2. Opens a store session (consensus cluster or embedded store)
//! 3. Starts the configuration manager: recover, initialize or repair
//! 4. Serves the REST API until Ctrl-C, resyncing after session expiry
//! 5. Stops the manager, leaving every record in place

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cassandra_config::ConfigurationManager;
use cassandra_core::SchedulerConfig;
use cassandra_state::{RecordStore, Session, SessionSettings, SessionState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub async fn run_consensus(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let settings = SessionSettings::from(&config.store);
    info!(endpoints = ?settings.endpoints, "connecting to consensus store");
    let session = cassandra_raft::connect(settings).await?;
    serve(config, session).await
}

pub async fn run_standalone(config_path: &Path, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = load(config_path)?;

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("scheduler.redb");
    let store = RecordStore::open(&db_path)?;
    info!(path = ?db_path, "embedded record store opened");

    let settings = SessionSettings {
        endpoints: vec![db_path.display().to_string()],
        ..SessionSettings::from(&config.store)
    };
    let session = Session::connect(Arc::new(store), settings).await?;
    serve(config, session).await
}

fn load(path: &Path) -> anyhow::Result<SchedulerConfig> {
    let config = SchedulerConfig::from_file(path)
        .with_context(|| format!("load {}", path.display()))?;
    info!(path = ?path, framework = %config.identity.name, "configuration file loaded");
    Ok(config)
}

async fn serve(config: SchedulerConfig, session: Session) -> anyhow::Result<()> {
    let defaults = config.defaults()?;
    let watch_interval = (session.settings().session_timeout / 3).max(Duration::from_millis(100));

    // ── Configuration manager ────────────────────────────────────
    let manager = Arc::new(ConfigurationManager::new(session));
    let snapshot = manager.start(defaults).await?;
    info!(
        servers = snapshot.config.topology.servers,
        seeds = snapshot.config.topology.seeds,
        version = %snapshot.config.cassandra.version,
        "configuration ready"
    );

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Session watchdog ─────────────────────────────────────────
    let watchdog_manager = Arc::clone(&manager);
    let mut watchdog_shutdown = shutdown_rx.clone();
    let watchdog = tokio::spawn(async move {
        let mut interval = tokio::time::interval(watch_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if watchdog_manager.session_state() != SessionState::Expired {
                        if let Err(e) = watchdog_manager.heartbeat().await {
                            debug!(error = %e, "store heartbeat failed");
                        }
                        continue;
                    }
                    warn!("store session expired, resynchronizing configuration");
                    match watchdog_manager.resync().await {
                        Ok(snapshot) => info!(
                            servers = snapshot.config.topology.servers,
                            seeds = snapshot.config.topology.seeds,
                            "configuration resynchronized"
                        ),
                        Err(e) => warn!(error = %e, "resync failed, retrying"),
                    }
                }
                _ = watchdog_shutdown.changed() => break,
            }
        }
    });

    // ── REST API server ──────────────────────────────────────────
    let router = cassandra_api::build_router(Arc::clone(&manager));
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port()));
    info!(%api_addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(api_addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            crate::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // ── Clean up ─────────────────────────────────────────────────
    let _ = watchdog.await;
    manager.stop().await?;

    info!("Cassandra scheduler stopped");
    Ok(())
}
