use axum::{Json, Router, extract::State, routing::post};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use crate::raft::types::{NodeId, TypeConfig};

use openraft::{
    Raft,
    error::{InstallSnapshotError, RaftError},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};

#[derive(Clone)]
pub struct RaftRpcState {
    pub raft: Raft<TypeConfig>,
}

/// Peer-to-peer Raft endpoints. Served on the raft listener, never on the client API.
pub fn build_raft_rpc_router(state: RaftRpcState) -> Router {
    Router::new()
        .route("/raft/append", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(install_snapshot))
        .with_state(state)
}

/// Serve the RPC router on `listener` until `shutdown` flips to `true`.
pub async fn serve_raft_rpc(
    listener: TcpListener,
    raft: Raft<TypeConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "raft rpc listening");

    let app = build_raft_rpc_router(RaftRpcState { raft });
    let res = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    match res {
        Ok(()) => info!(addr = ?local, "raft rpc stopped"),
        Err(err) => warn!(addr = ?local, error = %err, "raft rpc server failed"),
    }
}

async fn append_entries(
    State(state): State<RaftRpcState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.append_entries(req).await)
}

async fn vote(
    State(state): State<RaftRpcState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.raft.vote(req).await)
}

async fn install_snapshot(
    State(state): State<RaftRpcState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(state.raft.install_snapshot(req).await)
}
