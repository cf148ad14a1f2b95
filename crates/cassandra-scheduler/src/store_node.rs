//! Store node mode — one member of the consensus record store.
//!
//! In this mode, the daemon:
//! 1. Opens the node's redb database (Raft log + records)
//! 2. Serves Raft RPCs and the store client API over HTTP
//! 3. Bootstraps a new cluster, or joins the member given by `--join`

use std::path::PathBuf;
use std::time::Duration;

use cassandra_raft::StoreNode;
use tokio::sync::oneshot;
use tracing::info;

const LEADER_WAIT: Duration = Duration::from_secs(30);

pub async fn run_store_node(
    id: u64,
    listen: String,
    data_dir: PathBuf,
    join: Option<String>,
) -> anyhow::Result<()> {
    info!(id, %listen, "store node starting");

    let node = StoreNode::open(id, listen.clone(), &data_dir).await?;
    let listener = tokio::net::TcpListener::bind(&listen).await?;

    // Peers call back into this node while it joins, so serve first.
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(cassandra_raft::server::serve(
        node.clone(),
        listener,
        async move {
            let _ = stop_rx.await;
        },
    ));

    match join {
        Some(leader) => node.join(&leader).await?,
        None => node.initialize().await?,
    }
    let leader = node.wait_for_leader(LEADER_WAIT).await?;
    info!(id, leader, "store node ready");

    crate::shutdown_signal().await;

    let _ = stop_tx.send(());
    server.await??;
    node.shutdown().await?;

    info!(id, "store node stopped");
    Ok(())
}
