//! ConsensusClient — `Backend` over a set of store node endpoints.
//!
//! Calls go to the last known leader first, then to each configured
//! endpoint in order. Redirects from followers are followed. A write is
//! only retried elsewhere when it certainly was never sent; once a request
//! is on the wire a lost answer is reported as unreachable so the session
//! layer can surface the ambiguity.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cassandra_state::{
    Backend, CasFailure, Session, SessionSettings, StoreError, StoreOp, StoreResult, Version, VersionedRecord,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::http::post_json;
use crate::protocol::*;

/// Upper bound on redirects followed within one call.
const MAX_REDIRECTS: usize = 3;

#[derive(Debug)]
pub struct ConsensusClient {
    endpoints: Vec<String>,
    leader: Mutex<Option<String>>,
}

impl ConsensusClient {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            leader: Mutex::new(None),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn leader_hint(&self) -> Option<String> {
        self.leader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_leader(&self, addr: Option<String>) {
        *self
            .leader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }

    /// Addresses to try, last known leader first.
    fn candidates(&self) -> Vec<String> {
        let mut order: Vec<String> = self.leader_hint().into_iter().collect();
        for endpoint in &self.endpoints {
            if !order.contains(endpoint) {
                order.push(endpoint.clone());
            }
        }
        order
    }

    async fn call<Req, T>(&self, path: &'static str, body: &Req, idempotent: bool) -> StoreResult<T>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned,
    {
        if self.endpoints.is_empty() {
            return Err(StoreError::Unreachable("no store endpoints configured".to_string()));
        }

        let mut last_failure = String::new();
        for candidate in self.candidates() {
            let mut addr = candidate;
            for _ in 0..=MAX_REDIRECTS {
                match post_json::<Req, ClientReply<T>>(&addr, path, body).await {
                    Ok(ClientReply::Ok(value)) => {
                        self.remember_leader(Some(addr));
                        return Ok(value);
                    }
                    Ok(ClientReply::Redirect { leader: Some(leader) }) => {
                        debug!(from = %addr, to = %leader, path, "following leader redirect");
                        addr = leader;
                    }
                    Ok(ClientReply::Redirect { leader: None }) => {
                        last_failure = format!("{addr}: no leader known");
                        break;
                    }
                    Ok(ClientReply::Error(reason)) => {
                        last_failure = format!("{addr}: {reason}");
                        break;
                    }
                    Err(e) if e.is_connect() || idempotent => {
                        debug!(error = %e, path, "store endpoint failed");
                        last_failure = e.to_string();
                        break;
                    }
                    Err(e) => {
                        self.remember_leader(None);
                        return Err(StoreError::Unreachable(e.to_string()));
                    }
                }
            }
        }
        self.remember_leader(None);
        Err(StoreError::Unreachable(last_failure))
    }
}

#[async_trait]
impl Backend for ConsensusClient {
    async fn ping(&self) -> StoreResult<()> {
        self.call(PING_PATH, &PingRequest {}, true).await
    }

    async fn read(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        let req = ReadRequest {
            key: key.to_string(),
        };
        self.call(READ_PATH, &req, true).await
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<Version>> {
        let outcome: Result<Vec<Version>, CasFailure> =
            self.call(APPLY_PATH, &ApplyRequest { ops }, false).await?;
        outcome.map_err(StoreError::from)
    }
}

/// Open a store session against the endpoints in `settings`.
pub async fn connect(settings: SessionSettings) -> StoreResult<Session> {
    let client = Arc::new(ConsensusClient::new(settings.endpoints.clone()));
    Session::connect(client, settings).await
}
