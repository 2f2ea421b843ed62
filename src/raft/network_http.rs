use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::raft::types::{NodeId, NodeMeta, TypeConfig};

use openraft::{
    RaftNetwork, RaftNetworkFactory,
    error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable},
    network::RPCOption,
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Raft transport over HTTP+JSON, one pooled `reqwest` client shared by all peers.
#[derive(Debug, Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
    pool_size: usize,
    slots: Arc<Mutex<BTreeMap<NodeId, Arc<Semaphore>>>>,
}

impl HttpNetworkFactory {
    /// At most `pool_size` RPCs are in flight to one peer at a time, and as many idle connections
    /// are kept per peer. `connect_timeout` bounds dialing.
    pub fn try_new(pool_size: usize, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let pool_size = pool_size.max(1);
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_size)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            pool_size,
            slots: Arc::default(),
        })
    }

    async fn slots_for(&self, target: NodeId) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(target)
            .or_insert_with(|| Arc::new(Semaphore::new(self.pool_size)))
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct HttpNetwork {
    target: NodeId,
    base: String,
    client: reqwest::Client,
    slots: Arc<Semaphore>,
}

impl HttpNetwork {
    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn call<Req, Resp, E>(
        &self,
        path: &str,
        req: &Req,
        option: RPCOption,
    ) -> Result<Resp, RPCError<NodeId, NodeMeta, RaftError<NodeId, E>>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let ttl = option.hard_ttl();
        let _slot = match tokio::time::timeout(ttl, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return Err(RPCError::Network(NetworkError::new(&e))),
            Err(elapsed) => {
                debug!(target_node = self.target, path, "no free raft rpc slot");
                return Err(RPCError::Network(NetworkError::new(&elapsed)));
            }
        };

        let sent = self
            .client
            .post(self.url(path))
            .timeout(ttl)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                debug!(target_node = self.target, path, error = %e, "raft rpc unreachable");
                RPCError::Unreachable(Unreachable::new(&e))
            })?;

        let res: Result<Resp, RaftError<NodeId, E>> = sent
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        res.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &NodeMeta) -> Self::Network {
        HttpNetwork {
            target,
            base: node.raft_url(),
            client: self.client.clone(),
            slots: self.slots_for(target).await,
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, NodeMeta, RaftError<NodeId>>> {
        self.call("/raft/append", &rpc, option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, NodeMeta, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.call("/raft/snapshot", &rpc, option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, NodeMeta, RaftError<NodeId>>> {
        self.call("/raft/vote", &rpc, option).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(addr: &str) -> NodeMeta {
        NodeMeta {
            raft_addr: addr.to_string(),
            api_addr: String::new(),
        }
    }

    #[tokio::test]
    async fn clients_to_one_peer_share_its_slots() {
        let mut factory = HttpNetworkFactory::try_new(2, DEFAULT_RPC_TIMEOUT).unwrap();

        let a = factory.new_client(2, &meta("127.0.0.1:7002")).await;
        let b = factory.new_client(2, &meta("127.0.0.1:7002")).await;
        let c = factory.new_client(3, &meta("127.0.0.1:7003")).await;

        assert!(Arc::ptr_eq(&a.slots, &b.slots));
        assert!(!Arc::ptr_eq(&a.slots, &c.slots));
        assert_eq!(a.slots.available_permits(), 2);
        assert_eq!(a.url("/raft/vote"), "http://127.0.0.1:7002/raft/vote");
    }

    #[tokio::test]
    async fn rpc_waits_for_a_free_slot() {
        let mut factory = HttpNetworkFactory::try_new(1, DEFAULT_RPC_TIMEOUT).unwrap();
        let net = factory.new_client(2, &meta("127.0.0.1:1")).await;
        let _busy = net.slots.acquire().await.unwrap();

        let res: Result<VoteResponse<NodeId>, RPCError<NodeId, NodeMeta, RaftError<NodeId>>> = net
            .call(
                "/raft/vote",
                &VoteRequest::new(openraft::Vote::new(1, 1), None),
                RPCOption::new(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(res, Err(RPCError::Network(_))));
    }
}
