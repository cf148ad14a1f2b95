//! StoreNode — one member of the consensus record store.
//!
//! Owns the openraft instance, its redb-backed log and state machine, and
//! a read view over the state machine's record tables. The HTTP layer in
//! `server` is a thin shell over the methods here.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cassandra_state::{RecordStore, StoreOp};
use openraft::error::{CheckIsLeaderError, ClientWriteError, ForwardToLeader, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers, Config};
use redb::Database;
use tracing::{debug, info, warn};

use crate::http::post_json;
use crate::log_store::LogStore;
use crate::network::NetworkFactory;
use crate::protocol::*;
use crate::state_machine::StateMachine;
use crate::typ::{RecordRaft, Request};

const CLUSTER_NAME: &str = "cassandra-scheduler-store";

fn raft_config() -> anyhow::Result<Arc<Config>> {
    let config = Config {
        cluster_name: CLUSTER_NAME.to_string(),
        heartbeat_interval: 250,
        election_timeout_min: 1000,
        election_timeout_max: 2000,
        ..Default::default()
    }
    .validate()?;
    Ok(Arc::new(config))
}

fn redirect<T>(forward: ForwardToLeader<u64, BasicNode>) -> ClientReply<T> {
    ClientReply::Redirect {
        leader: forward.leader_node.map(|node| node.addr),
    }
}

pub struct StoreNode {
    id: u64,
    addr: String,
    raft: RecordRaft,
    records: RecordStore,
}

impl StoreNode {
    /// Open (or create) the node's database under `data_dir` and start Raft.
    pub async fn open(id: u64, addr: impl Into<String>, data_dir: &Path) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let path = data_dir.join(format!("node-{id}.redb"));
        let db = Database::create(&path).with_context(|| format!("open {}", path.display()))?;
        Self::start(id, addr, Arc::new(db)).await
    }

    /// Start Raft over an already open database.
    pub async fn start(id: u64, addr: impl Into<String>, db: Arc<Database>) -> anyhow::Result<Arc<Self>> {
        let addr = addr.into();
        let log_store = LogStore::new(Arc::clone(&db))?;
        let state_machine = StateMachine::new(Arc::clone(&db))?;
        let records = RecordStore::with_database(db)?;

        let raft = RecordRaft::new(id, raft_config()?, NetworkFactory, log_store, state_machine).await?;
        info!(id, %addr, "store node started");
        Ok(Arc::new(Self {
            id,
            addr,
            raft,
            records,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn raft(&self) -> &RecordRaft {
        &self.raft
    }

    /// Bootstrap a single-member cluster. A node that already belongs to a
    /// cluster is left alone.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let members = BTreeMap::from([(self.id, BasicNode::new(self.addr.clone()))]);
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(id = self.id, "initialized single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(id = self.id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the leader at `leader_addr` to add this node as a learner and
    /// then promote it to voter.
    pub async fn join(&self, leader_addr: &str) -> anyhow::Result<()> {
        let learner = AddLearnerRequest {
            id: self.id,
            addr: self.addr.clone(),
        };
        let reply: MembershipReply = post_json(leader_addr, ADD_LEARNER_PATH, &learner).await?;
        expect_ok(reply, "add learner")?;

        let promote = ChangeMembershipRequest {
            add_voters: BTreeSet::from([self.id]),
        };
        let reply: MembershipReply = post_json(leader_addr, CHANGE_MEMBERSHIP_PATH, &promote).await?;
        expect_ok(reply, "change membership")?;
        info!(id = self.id, leader = leader_addr, "joined cluster");
        Ok(())
    }

    /// Wait until some node is known as leader; returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> anyhow::Result<u64> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await?;
        metrics
            .current_leader
            .context("leader vanished while waiting")
    }

    pub fn ping(&self) -> PingReply {
        if self.raft.metrics().borrow().current_leader.is_some() {
            ClientReply::Ok(())
        } else {
            ClientReply::Error("no leader elected".to_string())
        }
    }

    /// Linearizable read served by the leader.
    pub async fn read(&self, key: &str) -> ReadReply {
        match self.raft.ensure_linearizable().await {
            Ok(_) => {}
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward))) => {
                return redirect(forward);
            }
            Err(e) => return ClientReply::Error(e.to_string()),
        }
        match self.records.get(key) {
            Ok(record) => ClientReply::Ok(record),
            Err(e) => ClientReply::Error(e.to_string()),
        }
    }

    pub async fn apply(&self, ops: Vec<StoreOp>) -> ApplyReply {
        match self.raft.client_write(Request::Apply { ops }).await {
            Ok(written) => {
                debug!(index = written.log_id.index, "batch committed");
                ClientReply::Ok(written.data.outcome)
            }
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => redirect(forward),
            Err(e) => {
                warn!(error = %e, "client write failed");
                ClientReply::Error(e.to_string())
            }
        }
    }

    pub async fn add_learner(&self, id: u64, addr: String) -> MembershipReply {
        match self.raft.add_learner(id, BasicNode::new(addr.clone()), true).await {
            Ok(_) => {
                info!(learner = id, %addr, "learner added");
                ClientReply::Ok(())
            }
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => redirect(forward),
            Err(e) => ClientReply::Error(e.to_string()),
        }
    }

    pub async fn add_voters(&self, voters: BTreeSet<u64>) -> MembershipReply {
        match self
            .raft
            .change_membership(ChangeMembers::AddVoterIds(voters.clone()), false)
            .await
        {
            Ok(_) => {
                info!(?voters, "voters added");
                ClientReply::Ok(())
            }
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => redirect(forward),
            Err(e) => ClientReply::Error(e.to_string()),
        }
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))?;
        info!(id = self.id, "store node stopped");
        Ok(())
    }
}

fn expect_ok(reply: MembershipReply, what: &str) -> anyhow::Result<()> {
    match reply {
        ClientReply::Ok(()) => Ok(()),
        ClientReply::Redirect { leader } => {
            anyhow::bail!("{what}: not the leader (leader is {leader:?})")
        }
        ClientReply::Error(e) => anyhow::bail!("{what}: {e}"),
    }
}
