use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    cluster::ClusterConfig,
    peers::Peer,
    raft::{NodeId, runtime::RaftTimings},
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "riot",
    about = "Replicated key-value store",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the node and its HTTP API (default).
    Run,

    /// Print the merged peer set and the bootstrap mode the node would use, then exit.
    Peers,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Client API listen address.
    #[arg(
        long,
        global = true,
        env = "RIOT_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub bind: SocketAddr,

    /// Raft RPC listen address.
    #[arg(
        long = "raft-bind",
        global = true,
        env = "RIOT_RAFT_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:7000"
    )]
    pub raft_bind: SocketAddr,

    /// Raft address other nodes dial. Defaults to --raft-bind.
    #[arg(
        long = "raft-advertise",
        global = true,
        env = "RIOT_RAFT_ADVERTISE",
        value_name = "HOST:PORT"
    )]
    pub raft_advertise: Option<String>,

    /// API address used to redirect follower writes. Defaults to --bind, unless --bind is a
    /// wildcard address, in which case it must be given for redirects to work.
    #[arg(
        long = "api-advertise",
        global = true,
        env = "RIOT_API_ADVERTISE",
        value_name = "HOST:PORT"
    )]
    pub api_advertise: Option<String>,

    #[arg(
        long = "node-id",
        global = true,
        env = "RIOT_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: NodeId,

    #[arg(
        long = "cluster-name",
        global = true,
        env = "RIOT_CLUSTER_NAME",
        value_name = "NAME",
        default_value = "riot"
    )]
    pub cluster_name: String,

    #[arg(
        long,
        global = true,
        env = "RIOT_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Known peer, repeatable: ID=RAFT_ADDR[,API_ADDR].
    #[arg(
        long = "peer",
        global = true,
        env = "RIOT_PEERS",
        value_name = "PEER",
        value_delimiter = ';'
    )]
    pub peers: Vec<Peer>,

    /// Peer list file. Defaults to <data-dir>/peers.json.
    #[arg(
        long = "peer-storage",
        global = true,
        env = "RIOT_PEER_STORAGE",
        value_name = "PATH"
    )]
    pub peer_storage: Option<PathBuf>,

    /// Bootstrap a one-node cluster when no peers are known.
    #[arg(
        long = "enable-single-node",
        global = true,
        env = "RIOT_ENABLE_SINGLE_NODE",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub enable_single_node: bool,

    #[arg(
        long = "snapshot-retain",
        global = true,
        env = "RIOT_SNAPSHOT_RETAIN",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=100)
    )]
    pub snapshot_retain: u64,

    /// Applied entries between automatic snapshots.
    #[arg(
        long = "snapshot-threshold",
        global = true,
        env = "RIOT_SNAPSHOT_THRESHOLD",
        value_name = "N",
        default_value_t = 8192,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_threshold: u64,

    /// Idle Raft RPC connections kept per peer.
    #[arg(
        long = "pool-size",
        global = true,
        env = "RIOT_POOL_SIZE",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=64)
    )]
    pub pool_size: u64,

    #[arg(
        long = "rpc-timeout-ms",
        global = true,
        env = "RIOT_RPC_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 2_000,
        value_parser = clap::value_parser!(u64).range(100..=60_000)
    )]
    pub rpc_timeout_ms: u64,

    /// How long a newly added peer may take to catch up before it is dropped again.
    #[arg(
        long = "catch-up-timeout-ms",
        global = true,
        env = "RIOT_CATCH_UP_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(100..=600_000)
    )]
    pub catch_up_timeout_ms: u64,

    #[arg(
        long = "heartbeat-ms",
        global = true,
        env = "RIOT_HEARTBEAT_MS",
        value_name = "MS",
        default_value_t = 250,
        value_parser = clap::value_parser!(u64).range(10..=10_000)
    )]
    pub heartbeat_ms: u64,

    #[arg(
        long = "election-timeout-min-ms",
        global = true,
        env = "RIOT_ELECTION_TIMEOUT_MIN_MS",
        value_name = "MS",
        default_value_t = 1_000,
        value_parser = clap::value_parser!(u64).range(50..=60_000)
    )]
    pub election_timeout_min_ms: u64,

    #[arg(
        long = "election-timeout-max-ms",
        global = true,
        env = "RIOT_ELECTION_TIMEOUT_MAX_MS",
        value_name = "MS",
        default_value_t = 2_000,
        value_parser = clap::value_parser!(u64).range(50..=120_000)
    )]
    pub election_timeout_max_ms: u64,
}

impl Config {
    pub fn timings(&self) -> RaftTimings {
        RaftTimings {
            heartbeat_ms: self.heartbeat_ms,
            election_min_ms: self.election_timeout_min_ms,
            election_max_ms: self.election_timeout_max_ms,
            snapshot_threshold: self.snapshot_threshold,
            ..RaftTimings::default()
        }
    }

    /// Empty when nothing was given and `--bind` is a wildcard address: peers cannot dial
    /// `0.0.0.0`, so no redirect target is advertised.
    pub fn api_advertise(&self) -> String {
        match &self.api_advertise {
            Some(addr) => addr.clone(),
            None if self.bind.ip().is_unspecified() => String::new(),
            None => self.bind.to_string(),
        }
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self.node_id,
            cluster_name: self.cluster_name.clone(),
            data_dir: self.data_dir.clone(),
            raft_bind: self.raft_bind,
            raft_advertise: self
                .raft_advertise
                .clone()
                .unwrap_or_else(|| self.raft_bind.to_string()),
            api_advertise: self.api_advertise(),
            peers: self.peers.clone(),
            peer_storage: self.peer_storage.clone(),
            enable_single_node: self.enable_single_node,
            snapshot_retain: self.snapshot_retain as usize,
            pool_size: self.pool_size as usize,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            catch_up_timeout: Duration::from_millis(self.catch_up_timeout_ms),
            timings: self.timings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["riot"]).unwrap();
        assert!(cli.command.is_none());
        let cluster = cli.config.cluster_config();
        assert_eq!(cluster.node_id, 1);
        assert_eq!(cluster.raft_advertise, "127.0.0.1:7000");
        assert_eq!(cluster.api_advertise, "127.0.0.1:8080");
        assert_eq!(cluster.snapshot_retain, 3);
        assert_eq!(cluster.pool_size, 3);
        assert_eq!(cluster.rpc_timeout, Duration::from_secs(2));
        assert_eq!(cluster.catch_up_timeout, Duration::from_secs(10));
        assert_eq!(cluster.peer_store_path(), PathBuf::from("./data/peers.json"));
        assert!(!cluster.enable_single_node);
        assert!(cluster.peers.is_empty());
    }

    #[test]
    fn wildcard_bind_advertises_no_api_address() {
        let cli = Cli::try_parse_from(["riot", "--bind", "0.0.0.0:8080"]).unwrap();
        assert_eq!(cli.config.cluster_config().api_advertise, "");

        let cli = Cli::try_parse_from([
            "riot",
            "--bind",
            "[::]:8080",
            "--api-advertise",
            "10.0.0.1:8080",
        ])
        .unwrap();
        assert_eq!(cli.config.cluster_config().api_advertise, "10.0.0.1:8080");
    }

    #[test]
    fn parses_repeated_peers() {
        let cli = Cli::try_parse_from([
            "riot",
            "run",
            "--peer",
            "2=10.0.0.2:7000",
            "--peer",
            "3=10.0.0.3:7000,10.0.0.3:8080",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Run)));
        let ids: Vec<NodeId> = cli.config.peers.iter().map(|p| p.node_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(cli.config.peers[1].api_addr, "10.0.0.3:8080");
    }

    #[test]
    fn rejects_malformed_peer() {
        let err = Cli::try_parse_from(["riot", "--peer", "10.0.0.2:7000"]).unwrap_err();
        assert!(err.to_string().contains("ID=RAFT_ADDR"));
    }

    #[test]
    fn rejects_zero_node_id() {
        let err = Cli::try_parse_from(["riot", "--node-id", "0"]).unwrap_err();
        assert!(err.to_string().contains("--node-id"));
    }

    #[test]
    fn rejects_invalid_snapshot_retain() {
        let err = Cli::try_parse_from(["riot", "--snapshot-retain", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--snapshot-retain"));
        assert!(msg.contains("1..=100"));
    }

    #[test]
    fn parses_enable_single_node_as_bool_value() {
        let cli = Cli::try_parse_from(["riot", "peers", "--enable-single-node", "true"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Peers)));
        assert!(cli.config.enable_single_node);
    }

    #[test]
    fn timings_follow_flags() {
        let cli = Cli::try_parse_from([
            "riot",
            "--heartbeat-ms",
            "100",
            "--election-timeout-min-ms",
            "400",
            "--election-timeout-max-ms",
            "800",
            "--snapshot-threshold",
            "50",
        ])
        .unwrap();
        let timings = cli.config.timings();
        assert_eq!(timings.heartbeat_ms, 100);
        assert_eq!(timings.election_min_ms, 400);
        assert_eq!(timings.election_max_ms, 800);
        assert_eq!(timings.snapshot_threshold, 50);
    }
}
