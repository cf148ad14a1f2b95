//! Raft network layer over HTTP.
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so that openraft
//! can talk between nodes. Each RPC is the openraft request as JSON,
//! answered with the serialized `Result` of the remote Raft call.

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::http::{TransportError, post_json};
use crate::typ::TypeConfig;

pub const APPEND_PATH: &str = "/raft/append";
pub const VOTE_PATH: &str = "/raft/vote";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";

/// Factory that creates per-peer HTTP connections.
#[derive(Debug, Clone, Default)]
pub struct NetworkFactory;

/// A single peer, addressed by its `BasicNode::addr`.
#[derive(Debug)]
pub struct NetworkConnection {
    target: u64,
    addr: String,
}

impl NetworkConnection {
    async fn send<Req, Resp, E>(
        &self,
        path: &'static str,
        rpc: &Req,
    ) -> Result<Resp, RPCError<u64, BasicNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let reply: Result<Resp, E> = post_json(&self.addr, path, rpc).await.map_err(|e| {
            warn!(target_node = self.target, addr = %self.addr, error = %e, "raft rpc failed");
            match e {
                TransportError::Connect { .. } => RPCError::Unreachable(Unreachable::new(&e)),
                _ => RPCError::Network(NetworkError::new(&e)),
            }
        })?;
        reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send(APPEND_PATH, &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.send(SNAPSHOT_PATH, &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send(VOTE_PATH, &rpc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_creates_connection() {
        let mut factory = NetworkFactory;
        let node = BasicNode::new("127.0.0.1:9100");
        let conn = factory.new_client(1, &node).await;
        assert_eq!(conn.target, 1);
        assert_eq!(conn.addr, "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported_as_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut conn = NetworkFactory.new_client(2, &BasicNode::new(addr)).await;
        let rpc = VoteRequest::<u64> {
            vote: openraft::Vote::new(1, 1),
            last_log_id: None,
        };
        let err = conn
            .vote(rpc, RPCOption::new(std::time::Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, RPCError::Unreachable(_)));
    }
}
