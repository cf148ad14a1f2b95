//! HTTP server of a store node — Raft RPCs plus the client and cluster
//! endpoints.
//!
//! Raft RPC bodies are the openraft request as JSON and the reply is the
//! JSON-encoded `Result` of the local Raft call, so remote errors reach
//! the caller intact.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::network::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH};
use crate::node::StoreNode;
use crate::protocol::*;
use crate::typ::TypeConfig;

type NodeState = State<Arc<StoreNode>>;

/// Build the node's router.
pub fn router(node: Arc<StoreNode>) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append_entries))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(install_snapshot))
        .route(PING_PATH, post(ping))
        .route(READ_PATH, post(read))
        .route(APPLY_PATH, post(apply))
        .route(ADD_LEARNER_PATH, post(add_learner))
        .route(CHANGE_MEMBERSHIP_PATH, post(change_membership))
        .with_state(node)
}

/// Serve the node on `listener` until `shutdown` resolves.
pub async fn serve<F>(node: Arc<StoreNode>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(id = node.id(), addr = node.addr(), "store node listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn append_entries(
    State(node): NodeState,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<u64>, RaftError<u64>>> {
    debug!(term = rpc.vote.leader_id().term, entries = rpc.entries.len(), "append_entries");
    Json(node.raft().append_entries(rpc).await)
}

async fn vote(
    State(node): NodeState,
    Json(rpc): Json<VoteRequest<u64>>,
) -> Json<Result<VoteResponse<u64>, RaftError<u64>>> {
    debug!(term = rpc.vote.leader_id().term, "vote");
    Json(node.raft().vote(rpc).await)
}

async fn install_snapshot(
    State(node): NodeState,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>>> {
    debug!(snapshot = %rpc.meta.snapshot_id, offset = rpc.offset, "install_snapshot");
    Json(node.raft().install_snapshot(rpc).await)
}

async fn ping(State(node): NodeState, Json(_): Json<PingRequest>) -> Json<PingReply> {
    Json(node.ping())
}

async fn read(State(node): NodeState, Json(req): Json<ReadRequest>) -> Json<ReadReply> {
    Json(node.read(&req.key).await)
}

async fn apply(State(node): NodeState, Json(req): Json<ApplyRequest>) -> Json<ApplyReply> {
    Json(node.apply(req.ops).await)
}

async fn add_learner(
    State(node): NodeState,
    Json(req): Json<AddLearnerRequest>,
) -> Json<MembershipReply> {
    Json(node.add_learner(req.id, req.addr).await)
}

async fn change_membership(
    State(node): NodeState,
    Json(req): Json<ChangeMembershipRequest>,
) -> Json<MembershipReply> {
    Json(node.add_voters(req.add_voters).await)
}
