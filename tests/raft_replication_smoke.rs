use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
};

use anyhow::Context as _;
use tokio::time::{Duration, Instant};

use riot::{
    cluster::{ClusterConfig, ClusterNode},
    command::Command,
    peers::{BootstrapMode, Peer},
    raft::{NodeId, app::WriteError, runtime::RaftTimings, types::ClientResponse},
};

fn node_config(node_id: NodeId, data_dir: &Path, single: bool) -> ClusterConfig {
    let mut config = ClusterConfig::new(
        node_id,
        data_dir,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
    );
    config.cluster_name = "riot-smoke".to_string();
    config.enable_single_node = single;
    config.api_advertise = format!("127.0.0.1:{}", 18_000 + node_id);
    config.timings = RaftTimings {
        heartbeat_ms: 50,
        election_min_ms: 150,
        election_max_ms: 300,
        ..RaftTimings::default()
    };
    config
}

async fn wait_for_leader(
    node: &ClusterNode,
    expected_leader: NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut rx = node.metrics();
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.current_leader == Some(expected_leader) {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for leader={expected_leader}; state={:?} current_leader={:?}",
                m.state,
                m.current_leader
            );
        }

        let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    }
}

async fn wait_for_voters(
    node: &ClusterNode,
    expected: &[NodeId],
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut rx = node.metrics();
    let deadline = Instant::now() + timeout;
    loop {
        let voters: Vec<NodeId> = rx.borrow().membership_config.voter_ids().collect();
        if voters == expected {
            return Ok(());
        }
        anyhow::ensure!(
            Instant::now() < deadline,
            "timeout waiting for voters={expected:?}; got {voters:?}"
        );
        let _ = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    }
}

async fn wait_for_value(
    node: &ClusterNode,
    key: &str,
    expected: Option<&str>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let got = node.get(key).await.ok();
        if got.as_deref() == expected.map(str::as_bytes) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {key}={expected:?}; got {got:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn start(config: ClusterConfig) -> anyhow::Result<Arc<ClusterNode>> {
    ClusterNode::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
}

#[tokio::test]
async fn raft_two_node_replication_smoke() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;

    let node1 = start(node_config(1, &tmp.path().join("node-1"), true)).await?;
    let node2 = start(node_config(2, &tmp.path().join("node-2"), false)).await?;
    assert_eq!(node2.bootstrap_mode(), BootstrapMode::AwaitJoin);

    wait_for_leader(&node1, 1, Duration::from_secs(10)).await?;

    node1
        .write(Command::set("a", "1"))
        .await
        .context("write before join")?;

    node1
        .add_peer(Peer {
            node_id: 2,
            raft_addr: node2.self_meta().raft_addr.clone(),
            api_addr: node2.self_meta().api_addr.clone(),
        })
        .await
        .context("add node-2")?;
    wait_for_voters(&node1, &[1, 2], Duration::from_secs(10)).await?;
    assert_eq!(node1.peers().await?.len(), 1);

    wait_for_value(&node2, "a", Some("1"), Duration::from_secs(10)).await?;

    assert_eq!(
        node1.write(Command::set("b", "2")).await?,
        ClientResponse::Ok
    );
    node1.write(Command::del("a")).await?;
    wait_for_value(&node2, "b", Some("2"), Duration::from_secs(10)).await?;
    wait_for_value(&node2, "a", None, Duration::from_secs(10)).await?;

    wait_for_leader(&node2, 1, Duration::from_secs(10)).await?;
    assert_eq!(node2.leader(), Some(1));
    let err = node2.write(Command::set("c", "3")).await.unwrap_err();
    match err {
        WriteError::ForwardToLeader { leader_id, leader } => {
            assert_eq!(leader_id, Some(1));
            assert_eq!(
                leader.map(|n| n.api_addr),
                Some("127.0.0.1:18001".to_string())
            );
        }
        other => panic!("expected forward to leader, got {other:?}"),
    }

    node2.shutdown().await?;
    node1.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn restart_restores_newest_snapshot() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let data_dir = tmp.path().join("node-1");

    let node = start(node_config(1, &data_dir, true)).await?;
    wait_for_leader(&node, 1, Duration::from_secs(10)).await?;
    node.write(Command::set("k", "v1")).await?;
    node.write(Command::set("gone", "x")).await?;
    node.write(Command::del("gone")).await?;

    node.trigger_snapshot().await?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while node.snapshots().list().await?.is_empty() {
        anyhow::ensure!(Instant::now() < deadline, "snapshot was not persisted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    node.shutdown().await?;
    drop(node);

    let restarted = start(node_config(1, &data_dir, true)).await?;
    assert_eq!(restarted.get("k").await.ok(), Some(b"v1".to_vec()));
    assert!(restarted.get("gone").await.is_err());
    restarted.shutdown().await?;
    Ok(())
}
