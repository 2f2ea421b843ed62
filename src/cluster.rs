//! The local node's membership in the consensus group.
//!
//! A [`ClusterNode`] owns the engine handle, the FSM it drives, the snapshot and peer stores, and
//! the two background tasks (Raft RPC server, leader monitor). Processes construct it through a
//! [`ClusterSlot`], which makes construction happen at most once.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::{Mutex, OnceCell, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    command::Command,
    fsm::{NotFound, StorageFsm},
    leader::spawn_leader_monitor,
    peers::{BootstrapMode, JsonPeerStore, Peer, bootstrap_mode, merge_peers},
    raft::{
        app::{BoxFuture, KvFacade, WriteError},
        http_rpc::serve_raft_rpc,
        network_http::{DEFAULT_POOL_SIZE, DEFAULT_RPC_TIMEOUT, HttpNetworkFactory},
        runtime::{RaftPaths, RaftTimings, open_state_machine, raft_config, start_raft},
        storage::{FileSnapshotStore, MemLogStore, snapshot_store::DEFAULT_RETAIN},
        types::{ClientRequest, ClientResponse, Metrics, NodeId, NodeMeta, TypeConfig},
    },
};

use openraft::{
    ChangeMembers,
    error::{ClientWriteError, RaftError},
};

pub const DEFAULT_CATCH_UP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub cluster_name: String,
    pub data_dir: PathBuf,
    pub raft_bind: SocketAddr,
    /// Address peers dial for Raft RPCs. Empty means the bound listener address.
    pub raft_advertise: String,
    /// Client API address advertised for follower redirects. May be empty.
    pub api_advertise: String,
    pub peers: Vec<Peer>,
    /// Defaults to `<data_dir>/peers.json`.
    pub peer_storage: Option<PathBuf>,
    pub enable_single_node: bool,
    pub snapshot_retain: usize,
    pub pool_size: usize,
    pub rpc_timeout: Duration,
    /// How long a new peer may take to catch up as a learner before it is dropped again.
    pub catch_up_timeout: Duration,
    pub timings: RaftTimings,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>, raft_bind: SocketAddr) -> Self {
        Self {
            node_id,
            cluster_name: "riot".to_string(),
            data_dir: data_dir.into(),
            raft_bind,
            raft_advertise: String::new(),
            api_advertise: String::new(),
            peers: Vec::new(),
            peer_storage: None,
            enable_single_node: false,
            snapshot_retain: DEFAULT_RETAIN,
            pool_size: DEFAULT_POOL_SIZE,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            catch_up_timeout: DEFAULT_CATCH_UP_TIMEOUT,
            timings: RaftTimings::default(),
        }
    }

    pub fn peer_store_path(&self) -> PathBuf {
        self.peer_storage
            .clone()
            .unwrap_or_else(|| self.data_dir.join("peers.json"))
    }
}

/// Construction step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    WorkDir,
    SnapshotStore,
    Transport,
    PeerStore,
    Restore,
    Engine,
    Bootstrap,
}

impl std::fmt::Display for InitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WorkDir => "work dir",
            Self::SnapshotStore => "snapshot store",
            Self::Transport => "transport",
            Self::PeerStore => "peer store",
            Self::Restore => "state machine restore",
            Self::Engine => "raft engine",
            Self::Bootstrap => "bootstrap",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct InitializationError {
    pub stage: InitStage,
    pub source: anyhow::Error,
}

impl InitializationError {
    fn at(stage: InitStage) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self { stage, source }
    }
}

impl std::fmt::Display for InitializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster initialization failed at {}: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for InitializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

struct NodeTasks {
    monitor: JoinHandle<u64>,
    rpc: JoinHandle<()>,
}

pub struct ClusterNode {
    config: ClusterConfig,
    paths: RaftPaths,
    raft: openraft::Raft<TypeConfig>,
    fsm: StorageFsm,
    snapshots: FileSnapshotStore,
    peer_store: JsonPeerStore,
    self_meta: NodeMeta,
    bootstrap: BootstrapMode,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<NodeTasks>>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.config.node_id)
            .field("self_meta", &self.self_meta)
            .field("bootstrap", &self.bootstrap)
            .finish_non_exhaustive()
    }
}

impl ClusterNode {
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>, InitializationError> {
        let node_id = config.node_id;
        let paths = RaftPaths::new(&config.data_dir);

        tokio::fs::create_dir_all(&paths.root)
            .await
            .map_err(|e| anyhow::anyhow!("create {}: {e}", paths.root.display()))
            .map_err(InitializationError::at(InitStage::WorkDir))?;

        let log_store = MemLogStore::new();
        let fsm = StorageFsm::new();

        let snapshots = FileSnapshotStore::open(&paths.snapshot_dir, config.snapshot_retain)
            .map_err(|e| anyhow::anyhow!("open {}: {e}", paths.snapshot_dir.display()))
            .map_err(InitializationError::at(InitStage::SnapshotStore))?;

        let listener = TcpListener::bind(config.raft_bind)
            .await
            .map_err(|e| anyhow::anyhow!("bind raft listener {}: {e}", config.raft_bind))
            .map_err(InitializationError::at(InitStage::Transport))?;
        let raft_addr = if config.raft_advertise.is_empty() {
            listener
                .local_addr()
                .map_err(|e| anyhow::anyhow!("raft listener local_addr: {e}"))
                .map_err(InitializationError::at(InitStage::Transport))?
                .to_string()
        } else {
            config.raft_advertise.clone()
        };
        let network = HttpNetworkFactory::try_new(config.pool_size, config.rpc_timeout)
            .map_err(|e| anyhow::anyhow!("build raft rpc client: {e}"))
            .map_err(InitializationError::at(InitStage::Transport))?;

        let peer_store = JsonPeerStore::new(config.peer_store_path());
        let stored = peer_store
            .load()
            .map_err(anyhow::Error::new)
            .map_err(InitializationError::at(InitStage::PeerStore))?;
        let peers = merge_peers(node_id, &raft_addr, stored, &config.peers);
        peer_store
            .save(&peers)
            .map_err(anyhow::Error::new)
            .map_err(InitializationError::at(InitStage::PeerStore))?;
        let bootstrap = bootstrap_mode(config.enable_single_node, &peers);

        let state_machine = open_state_machine(fsm.clone(), snapshots.clone())
            .await
            .map_err(InitializationError::at(InitStage::Restore))?;
        let raft_config = raft_config(&config.cluster_name, &config.timings)
            .map_err(InitializationError::at(InitStage::Engine))?;
        let raft = start_raft(node_id, raft_config, network, log_store, state_machine)
            .await
            .map_err(InitializationError::at(InitStage::Engine))?;

        let self_meta = NodeMeta {
            raft_addr,
            api_addr: config.api_advertise.clone(),
        };
        bootstrap_membership(&raft, node_id, &self_meta, bootstrap, &peers)
            .await
            .map_err(InitializationError::at(InitStage::Bootstrap))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = spawn_leader_monitor(node_id, raft.metrics(), shutdown_rx.clone());
        let rpc = tokio::spawn(serve_raft_rpc(listener, raft.clone(), shutdown_rx));

        info!(
            node_id,
            raft_addr = %self_meta.raft_addr,
            api_addr = %self_meta.api_addr,
            %bootstrap,
            peers = peers.len(),
            "cluster node started"
        );

        Ok(Arc::new(Self {
            config,
            paths,
            raft,
            fsm,
            snapshots,
            peer_store,
            self_meta,
            bootstrap,
            shutdown_tx,
            tasks: Mutex::new(Some(NodeTasks { monitor, rpc })),
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn paths(&self) -> &RaftPaths {
        &self.paths
    }

    pub fn self_meta(&self) -> &NodeMeta {
        &self.self_meta
    }

    pub fn bootstrap_mode(&self) -> BootstrapMode {
        self.bootstrap
    }

    pub fn snapshots(&self) -> &FileSnapshotStore {
        &self.snapshots
    }

    /// Local read. Followers may return stale values.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, NotFound> {
        self.fsm.get(key).await
    }

    /// The engine's current leader hint; `None` while an election is in progress.
    pub fn leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Joining is operator-driven: a leader adds this node with [`ClusterNode::add_peer`].
    /// Nothing happens here beyond logging how to do that.
    pub async fn join(&self) -> anyhow::Result<()> {
        info!(
            node_id = self.config.node_id,
            raft_addr = %self.self_meta.raft_addr,
            "join requested; add this node from the leader via POST /admin/peers"
        );
        Ok(())
    }

    pub async fn write(&self, cmd: Command) -> Result<ClientResponse, WriteError> {
        let key = cmd.key().to_string();
        let resp = self
            .raft
            .client_write(ClientRequest::from(&cmd))
            .await
            .map_err(write_error)?;
        debug!(key = %key, op = cmd.op(), index = resp.log_id.index, "write committed");
        Ok(resp.data)
    }

    /// Add `peer` as a learner, promote it to voter once caught up, then record it.
    ///
    /// A learner that does not catch up within `catch_up_timeout` is removed again and the call
    /// fails.
    pub async fn add_peer(&self, peer: Peer) -> Result<(), WriteError> {
        let added = self
            .raft
            .add_learner(peer.node_id, peer.meta(), false)
            .await
            .map_err(write_error)?;
        let target = added.log_id.index;
        let node_id = peer.node_id;

        let caught_up = self
            .raft
            .wait(Some(self.config.catch_up_timeout))
            .metrics(
                |m| {
                    m.replication
                        .as_ref()
                        .and_then(|r| r.get(&node_id).copied().flatten())
                        .is_some_and(|matched| matched.index >= target)
                },
                format!("learner {node_id} catches up to {target}"),
            )
            .await;
        if let Err(err) = caught_up {
            warn!(peer = %peer, error = %err, "learner did not catch up; removing it");
            if let Err(rm) = self
                .raft
                .change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([node_id])), false)
                .await
            {
                warn!(peer = %peer, error = %rm, "remove stalled learner");
            }
            return Err(WriteError::Raft(format!(
                "peer {node_id} did not catch up within {:?}: {err}",
                self.config.catch_up_timeout
            )));
        }

        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([peer.node_id])), false)
            .await
            .map_err(write_error)?;
        info!(peer = %peer, "peer added");

        let store = self.peer_store.clone();
        run_blocking(move || store.upsert(peer).map(|_| ())).await
    }

    pub async fn remove_peer(&self, node_id: NodeId) -> Result<(), WriteError> {
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([node_id])), false)
            .await
            .map_err(write_error)?;
        info!(node_id, "peer removed");

        let store = self.peer_store.clone();
        run_blocking(move || store.remove(node_id).map(|_| ())).await
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<Peer>> {
        let store = self.peer_store.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| anyhow::anyhow!("join peer store task: {e}"))?
            .map_err(anyhow::Error::new)
    }

    pub async fn trigger_snapshot(&self) -> anyhow::Result<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| anyhow::anyhow!("trigger snapshot: {e}"))
    }

    pub fn metrics(&self) -> watch::Receiver<Metrics> {
        self.raft.metrics()
    }

    /// Stop the leader monitor and RPC server, then the engine. Later calls are no-ops.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };
        let _ = self.shutdown_tx.send(true);

        match tasks.monitor.await {
            Ok(transitions) => debug!(transitions, "leader monitor joined"),
            Err(err) => warn!(error = %err, "leader monitor task failed"),
        }
        if let Err(err) = tasks.rpc.await {
            warn!(error = %err, "raft rpc task failed");
        }
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))?;
        info!(node_id = self.config.node_id, "cluster node stopped");
        Ok(())
    }
}

async fn bootstrap_membership(
    raft: &openraft::Raft<TypeConfig>,
    node_id: NodeId,
    self_meta: &NodeMeta,
    mode: BootstrapMode,
    peers: &[Peer],
) -> anyhow::Result<()> {
    let initialized = raft
        .is_initialized()
        .await
        .map_err(|e| anyhow::anyhow!("raft is_initialized: {e}"))?;
    if initialized {
        info!(node_id, "raft state already initialized");
        return Ok(());
    }

    let mut members = BTreeMap::from([(node_id, self_meta.clone())]);
    match mode {
        BootstrapMode::SingleNode => {}
        BootstrapMode::StaticPeers => {
            members.extend(peers.iter().map(|p| (p.node_id, p.meta())));
        }
        BootstrapMode::AwaitJoin => {
            info!(node_id, "no peers known; waiting to be added to a cluster");
            return Ok(());
        }
    }

    info!(node_id, members = members.len(), %mode, "initializing raft membership");
    raft.initialize(members)
        .await
        .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))
}

fn write_error(err: RaftError<NodeId, ClientWriteError<NodeId, NodeMeta>>) -> WriteError {
    match err.api_error() {
        Some(ClientWriteError::ForwardToLeader(forward)) => WriteError::ForwardToLeader {
            leader_id: forward.leader_id,
            leader: forward.leader_node.clone(),
        },
        _ => WriteError::Raft(err.to_string()),
    }
}

async fn run_blocking<F, E>(f: F) -> Result<(), WriteError>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WriteError::PeerStore(e.to_string()))?
        .map_err(|e| WriteError::PeerStore(e.to_string()))
}

impl KvFacade for ClusterNode {
    fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    fn metrics(&self) -> watch::Receiver<Metrics> {
        ClusterNode::metrics(self)
    }

    fn get(&self, key: String) -> BoxFuture<'_, Result<Vec<u8>, NotFound>> {
        Box::pin(async move { ClusterNode::get(self, &key).await })
    }

    fn key_count(&self) -> BoxFuture<'_, usize> {
        Box::pin(self.fsm.len())
    }

    fn write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, WriteError>> {
        Box::pin(ClusterNode::write(self, cmd))
    }

    fn peers(&self) -> BoxFuture<'_, anyhow::Result<Vec<Peer>>> {
        Box::pin(ClusterNode::peers(self))
    }

    fn add_peer(&self, peer: Peer) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(ClusterNode::add_peer(self, peer))
    }

    fn remove_peer(&self, node_id: NodeId) -> BoxFuture<'_, Result<(), WriteError>> {
        Box::pin(ClusterNode::remove_peer(self, node_id))
    }

    fn trigger_snapshot(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(ClusterNode::trigger_snapshot(self))
    }
}

/// Holds the process's single [`ClusterNode`].
#[derive(Debug, Default)]
pub struct ClusterSlot {
    node: OnceCell<Arc<ClusterNode>>,
}

impl ClusterSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the node on the first call; later calls return the same node.
    pub async fn get_or_start(
        &self,
        config: ClusterConfig,
    ) -> Result<Arc<ClusterNode>, InitializationError> {
        let node = self
            .node
            .get_or_try_init(|| ClusterNode::start(config.clone()))
            .await?;
        if node.config() != &config {
            warn!(
                node_id = node.node_id(),
                "cluster node already started with a different config; keeping the running node"
            );
        }
        Ok(node.clone())
    }

    pub fn get(&self) -> Option<Arc<ClusterNode>> {
        self.node.get().cloned()
    }
}
