use std::io::Cursor;

use serde::{Deserialize, Serialize};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// `host:port` of the node's Raft RPC listener.
    pub raft_addr: String,

    /// `host:port` of the node's client API, used to redirect follower writes. May be empty.
    #[serde(default)]
    pub api_addr: String,
}

impl NodeMeta {
    pub fn raft_url(&self) -> String {
        with_http_scheme(&self.raft_addr)
    }

    pub fn api_url(&self) -> Option<String> {
        if self.api_addr.is_empty() {
            None
        } else {
            Some(with_http_scheme(&self.api_addr))
        }
    }
}

impl std::fmt::Display for NodeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "raft={} api={}", self.raft_addr, self.api_addr)
    }
}

fn with_http_scheme(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Engine metrics as published on the `Raft::metrics()` watch channel.
pub type Metrics = openraft::RaftMetrics<NodeId, NodeMeta>;

/// Log entry payload: an encoded [`crate::command::Command`].
///
/// The bytes stay opaque until the state machine applies the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(with = "crate::command::serde_base64")]
    pub payload: Vec<u8>,
}

impl From<&crate::command::Command> for ClientRequest {
    fn from(cmd: &crate::command::Command) -> Self {
        Self {
            payload: cmd.encode(),
        }
    }
}

/// State-machine response to a committed `ClientRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientResponse {
    Ok,
    /// The entry was committed but did not decode; the mapping is unchanged.
    Rejected { code: String, message: String },
}

/// OpenRaft type configuration for this project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = ClientRequest;
    type R = ClientResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
