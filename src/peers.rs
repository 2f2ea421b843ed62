//! Cluster peer list: the persisted `peers.json` file plus peers given on the command line.

use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::raft::types::{NodeId, NodeMeta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,
    pub raft_addr: String,
    #[serde(default)]
    pub api_addr: String,
}

impl Peer {
    pub fn meta(&self) -> NodeMeta {
        NodeMeta {
            raft_addr: self.raft_addr.clone(),
            api_addr: self.api_addr.clone(),
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.node_id, self.raft_addr)?;
        if !self.api_addr.is_empty() {
            write!(f, ",{}", self.api_addr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerParseError {
    pub input: String,
    pub reason: &'static str,
}

impl std::fmt::Display for PeerParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid peer {:?} ({}); expected ID=RAFT_ADDR[,API_ADDR]",
            self.input, self.reason
        )
    }
}

impl std::error::Error for PeerParseError {}

impl FromStr for Peer {
    type Err = PeerParseError;

    /// Parse `ID=RAFT_ADDR[,API_ADDR]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PeerParseError {
            input: s.to_string(),
            reason,
        };
        let (id, addrs) = s.split_once('=').ok_or_else(|| err("missing '='"))?;
        let node_id = id
            .trim()
            .parse::<NodeId>()
            .map_err(|_| err("node id is not an unsigned integer"))?;
        let (raft_addr, api_addr) = match addrs.split_once(',') {
            Some((raft, api)) => (raft.trim(), api.trim()),
            None => (addrs.trim(), ""),
        };
        if raft_addr.is_empty() {
            return Err(err("empty raft address"));
        }
        Ok(Self {
            node_id,
            raft_addr: raft_addr.to_string(),
            api_addr: api_addr.to_string(),
        })
    }
}

#[derive(Debug)]
pub enum PeerStoreError {
    Io { path: PathBuf, source: io::Error },
    Malformed { path: PathBuf, source: serde_json::Error },
}

impl std::fmt::Display for PeerStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "peer store {}: {source}", path.display()),
            Self::Malformed { path, source } => {
                write!(f, "peer store {} is not a JSON peer list: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for PeerStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Malformed { source, .. } => Some(source),
        }
    }
}

/// Peer list persisted as a JSON array.
#[derive(Debug, Clone)]
pub struct JsonPeerStore {
    path: PathBuf,
}

impl JsonPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty peer list.
    pub fn load(&self) -> Result<Vec<Peer>, PeerStoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PeerStoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| PeerStoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, peers: &[Peer]) -> Result<(), PeerStoreError> {
        let io_err = |source| PeerStoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(peers).map_err(|e| io_err(io::Error::other(e)))?;
        write_atomic(&self.path, &bytes).map_err(io_err)?;
        debug!(path = %self.path.display(), peers = peers.len(), "peer store saved");
        Ok(())
    }

    /// Insert or replace `peer` (by node id or raft address) and save.
    pub fn upsert(&self, peer: Peer) -> Result<Vec<Peer>, PeerStoreError> {
        let mut peers = self.load()?;
        add_unique(&mut peers, peer);
        self.save(&peers)?;
        Ok(peers)
    }

    pub fn remove(&self, node_id: NodeId) -> Result<Vec<Peer>, PeerStoreError> {
        let mut peers = self.load()?;
        peers.retain(|p| p.node_id != node_id);
        self.save(&peers)?;
        Ok(peers)
    }
}

fn add_unique(peers: &mut Vec<Peer>, peer: Peer) {
    peers.retain(|p| p.node_id != peer.node_id && p.raft_addr != peer.raft_addr);
    peers.push(peer);
    peers.sort_by_key(|p| p.node_id);
}

/// Merge stored and configured peers.
///
/// A configured peer replaces any stored peer with the same node id or raft address. The local
/// node (by id or raft address) is never part of the result.
pub fn merge_peers(
    self_id: NodeId,
    self_raft_addr: &str,
    stored: Vec<Peer>,
    configured: &[Peer],
) -> Vec<Peer> {
    let mut merged = Vec::with_capacity(stored.len() + configured.len());
    for peer in stored {
        add_unique(&mut merged, peer);
    }
    for peer in configured {
        add_unique(&mut merged, peer.clone());
    }
    merged.retain(|p| {
        let is_self = p.node_id == self_id || p.raft_addr == self_raft_addr;
        if is_self {
            debug!(peer = %p, "dropping local node from peer set");
        }
        !is_self
    });
    merged
}

/// How the local node joins the consensus group on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    /// Become a one-member cluster immediately.
    SingleNode,
    /// Initialize membership as the local node plus all known peers.
    StaticPeers,
    /// Do nothing; wait for an operator to add this node to an existing cluster.
    AwaitJoin,
}

impl std::fmt::Display for BootstrapMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleNode => f.write_str("single-node"),
            Self::StaticPeers => f.write_str("static-peers"),
            Self::AwaitJoin => f.write_str("await-join"),
        }
    }
}

/// Single-node bootstrap only applies while the peer set is empty.
pub fn bootstrap_mode(enable_single_node: bool, peers: &[Peer]) -> BootstrapMode {
    match (enable_single_node, peers.is_empty()) {
        (true, true) => BootstrapMode::SingleNode,
        (true, false) => {
            warn!(
                peers = peers.len(),
                "single-node bootstrap requested but peers are known; ignoring"
            );
            BootstrapMode::StaticPeers
        }
        (false, false) => BootstrapMode::StaticPeers,
        (false, true) => BootstrapMode::AwaitJoin,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}
