use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;

use crate::{
    fsm::StorageFsm,
    raft::{
        network_http::HttpNetworkFactory,
        storage::{FileSnapshotStore, KvStateMachine, MemLogStore},
        types::{NodeId, TypeConfig},
    },
};

/// Directory layout under the node's data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftPaths {
    pub root: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl RaftPaths {
    pub fn new(data_dir: &Path) -> Self {
        let root = data_dir.join("raft");
        let snapshot_dir = root.join("snapshots");
        Self { root, snapshot_dir }
    }
}

/// Engine timing and compaction knobs, all in milliseconds except the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftTimings {
    pub heartbeat_ms: u64,
    pub election_min_ms: u64,
    pub election_max_ms: u64,
    pub install_snapshot_timeout_ms: u64,
    /// Build a snapshot after this many applied entries since the last one.
    pub snapshot_threshold: u64,
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            heartbeat_ms: 250,
            election_min_ms: 1_000,
            election_max_ms: 2_000,
            install_snapshot_timeout_ms: 10_000,
            snapshot_threshold: 8_192,
        }
    }
}

pub fn raft_config(cluster_name: &str, timings: &RaftTimings) -> anyhow::Result<Arc<openraft::Config>> {
    let config = openraft::Config {
        cluster_name: cluster_name.to_string(),
        heartbeat_interval: timings.heartbeat_ms,
        election_timeout_min: timings.election_min_ms,
        election_timeout_max: timings.election_max_ms,
        install_snapshot_timeout: timings.install_snapshot_timeout_ms,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(timings.snapshot_threshold),
        ..Default::default()
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;
    Ok(Arc::new(config))
}

/// Restore the state machine from `snapshots` and wrap it in an engine adapter.
pub async fn open_state_machine(
    fsm: StorageFsm,
    snapshots: FileSnapshotStore,
) -> anyhow::Result<KvStateMachine> {
    KvStateMachine::open(fsm, snapshots)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))
}

pub async fn start_raft(
    node_id: NodeId,
    config: Arc<openraft::Config>,
    network: HttpNetworkFactory,
    log_store: MemLogStore,
    state_machine: KvStateMachine,
) -> anyhow::Result<openraft::Raft<TypeConfig>> {
    let raft =
        openraft::Raft::<TypeConfig>::new(node_id, config, network, log_store, state_machine)
            .await
            .context("start raft")?;
    Ok(raft)
}
