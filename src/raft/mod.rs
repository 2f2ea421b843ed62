//! Consensus plumbing around `openraft`: storage adapters, HTTP transport, and the facade the
//! client API talks to.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use types::{Metrics, NodeId, NodeMeta, TypeConfig};
