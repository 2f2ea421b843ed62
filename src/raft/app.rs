use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex, watch};

use crate::{
    command::Command,
    fsm::{NotFound, StorageFsm},
    peers::Peer,
    raft::storage::state_machine::REJECTED_INVALID_COMMAND,
    raft::types::{ClientResponse, Metrics, NodeId, NodeMeta},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// This node is not the leader. `leader` carries whatever the engine knows about who is.
    ForwardToLeader {
        leader_id: Option<NodeId>,
        leader: Option<NodeMeta>,
    },
    Raft(String),
    /// The membership change committed but the local peer store could not be updated.
    PeerStore(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForwardToLeader {
                leader_id: Some(id),
                ..
            } => write!(f, "not the leader; forward to node {id}"),
            Self::ForwardToLeader { leader_id: None, .. } => {
                write!(f, "not the leader and no leader is known")
            }
            Self::Raft(msg) => write!(f, "raft write failed: {msg}"),
            Self::PeerStore(msg) => write!(f, "peer store update failed: {msg}"),
        }
    }
}

impl std::error::Error for WriteError {}

/// What the HTTP layer needs from a node.
pub trait KvFacade: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    fn metrics(&self) -> watch::Receiver<Metrics>;

    fn get(&self, key: String) -> BoxFuture<'_, Result<Vec<u8>, NotFound>>;

    fn key_count(&self) -> BoxFuture<'_, usize>;

    fn write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, WriteError>>;

    fn peers(&self) -> BoxFuture<'_, anyhow::Result<Vec<Peer>>>;

    fn add_peer(&self, peer: Peer) -> BoxFuture<'_, Result<(), WriteError>>;

    fn remove_peer(&self, node_id: NodeId) -> BoxFuture<'_, Result<(), WriteError>>;

    fn trigger_snapshot(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Leader id and, if membership knows it, its metadata.
pub fn leader_from_metrics(metrics: &Metrics) -> Option<(NodeId, Option<NodeMeta>)> {
    let leader_id = metrics.current_leader?;
    let node = metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .map(|(_id, node)| node.clone());
    Some((leader_id, node))
}

/// Client API URL of the leader named in a forward error, falling back to membership metrics.
pub fn leader_api_url(
    leader_id: Option<NodeId>,
    leader: Option<&NodeMeta>,
    metrics: &Metrics,
) -> Option<String> {
    if let Some(url) = leader.and_then(NodeMeta::api_url) {
        return Some(url);
    }
    let leader_id = leader_id.or(metrics.current_leader)?;
    metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .and_then(|(_id, node)| node.api_url())
}

/// In-process facade for tests: applies commands straight to a [`StorageFsm`].
///
/// Writes succeed only while the metrics name this node as leader, so redirect handling can be
/// exercised without a running engine.
#[derive(Clone)]
pub struct LocalKv {
    node_id: NodeId,
    fsm: StorageFsm,
    peers: Arc<Mutex<Vec<Peer>>>,
    metrics: watch::Receiver<Metrics>,
    snapshots: Arc<AtomicU64>,
}

impl LocalKv {
    pub fn new(node_id: NodeId, fsm: StorageFsm, metrics: watch::Receiver<Metrics>) -> Self {
        Self {
            node_id,
            fsm,
            peers: Arc::default(),
            metrics,
            snapshots: Arc::default(),
        }
    }

    pub fn fsm(&self) -> &StorageFsm {
        &self.fsm
    }

    pub fn snapshots_triggered(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }
}

impl KvFacade for LocalKv {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    fn get(&self, key: String) -> BoxFuture<'_, Result<Vec<u8>, NotFound>> {
        Box::pin(async move { self.fsm.get(&key).await })
    }

    fn key_count(&self) -> BoxFuture<'_, usize> {
        Box::pin(self.fsm.len())
    }

    fn write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, WriteError>> {
        Box::pin(async move {
            let leader = leader_from_metrics(&self.metrics.borrow());
            match leader {
                Some((id, _)) if id == self.node_id => {}
                Some((id, node)) => {
                    return Err(WriteError::ForwardToLeader {
                        leader_id: Some(id),
                        leader: node,
                    });
                }
                None => {
                    return Err(WriteError::ForwardToLeader {
                        leader_id: None,
                        leader: None,
                    });
                }
            }
            Ok(match self.fsm.apply(&cmd.encode()).await {
                Ok(_) => ClientResponse::Ok,
                Err(err) => ClientResponse::Rejected {
                    code: REJECTED_INVALID_COMMAND.to_string(),
                    message: err.to_string(),
                },
            })
        })
    }

    fn peers(&self) -> BoxFuture<'_, anyhow::Result<Vec<Peer>>> {
        Box::pin(async move { Ok(self.peers.lock().await.clone()) })
    }

    fn add_peer(&self, peer: Peer) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            let mut peers = self.peers.lock().await;
            peers.retain(|p| p.node_id != peer.node_id);
            peers.push(peer);
            peers.sort_by_key(|p| p.node_id);
            Ok(())
        })
    }

    fn remove_peer(&self, node_id: NodeId) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(async move {
            let mut peers = self.peers.lock().await;
            let before = peers.len();
            peers.retain(|p| p.node_id != node_id);
            if peers.len() == before {
                return Err(WriteError::Raft(format!("node {node_id} is not a member")));
            }
            Ok(())
        })
    }

    fn trigger_snapshot(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.snapshots.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}
