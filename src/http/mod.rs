use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, FromRequest, Path, Query, Request},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    command::Command,
    peers::Peer,
    raft::{
        app::{KvFacade, WriteError, leader_api_url, leader_from_metrics},
        types::{ClientResponse, Metrics, NodeId, NodeMeta},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvFacade>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn no_leader(message: impl Into<String>) -> Self {
        Self::new("no_leader", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

impl KeyQuery {
    fn into_key(self) -> Result<String, ApiError> {
        match self.key {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ApiError::invalid_request("missing query parameter: key")),
        }
    }
}

pub fn build_router(kv: Arc<dyn KvFacade>) -> Router {
    let admin = Router::new()
        .route("/leader", get(admin_leader))
        .route("/peers", get(admin_list_peers).post(admin_add_peer))
        .route("/peers/:node_id", axum::routing::delete(admin_remove_peer))
        .route("/stats", get(admin_stats))
        .route("/snapshot", post(admin_snapshot));

    Router::new()
        .route("/health", get(health))
        .route(
            "/riot",
            get(riot_get)
                .put(riot_set)
                .post(riot_set)
                .delete(riot_delete),
        )
        .nest("/admin", admin)
        .fallback(fallback_not_found)
        .layer(Extension(AppState { kv }))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": state.kv.node_id(),
    }))
}

async fn riot_get(
    Extension(state): Extension<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let key = query.into_key()?;
    let value = state
        .kv
        .get(key)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        value,
    )
        .into_response())
}

async fn riot_set(
    Extension(state): Extension<AppState>,
    uri: Uri,
    Query(query): Query<KeyQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let key = query.into_key()?;
    submit(&state, &uri, Command::set(key, body.to_vec())).await
}

async fn riot_delete(
    Extension(state): Extension<AppState>,
    uri: Uri,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let key = query.into_key()?;
    submit(&state, &uri, Command::del(key)).await
}

async fn submit(state: &AppState, uri: &Uri, cmd: Command) -> Result<Response, ApiError> {
    match state.kv.write(cmd).await {
        Ok(ClientResponse::Ok) => Ok(StatusCode::NO_CONTENT.into_response()),
        Ok(ClientResponse::Rejected { code, message }) => {
            Err(ApiError::invalid_request(message).with_detail("reason", code))
        }
        Err(err) => write_error_response(state, uri, err),
    }
}

/// Followers answer writes with a redirect to the leader's client API.
fn write_error_response(state: &AppState, uri: &Uri, err: WriteError) -> Result<Response, ApiError> {
    match err {
        WriteError::ForwardToLeader { leader_id, leader } => {
            let metrics = state.kv.metrics().borrow().clone();
            let Some(base) = leader_api_url(leader_id, leader.as_ref(), &metrics) else {
                return Err(ApiError::no_leader("no leader available"));
            };
            let suffix = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| uri.path());
            let location = format!("{}{}", base.trim_end_matches('/'), suffix);
            debug!(leader_id = ?leader_id, %location, "redirecting write to leader");
            Ok(Redirect::temporary(&location).into_response())
        }
        WriteError::Raft(message) | WriteError::PeerStore(message) => {
            warn!(error = %message, "write failed");
            Err(ApiError::internal(message))
        }
    }
}

#[derive(Serialize)]
struct LeaderResponse {
    node_id: NodeId,
    is_leader: bool,
    leader_id: Option<NodeId>,
    leader: Option<NodeMeta>,
    term: u64,
}

async fn admin_leader(Extension(state): Extension<AppState>) -> Json<LeaderResponse> {
    let metrics = state.kv.metrics().borrow().clone();
    let node_id = state.kv.node_id();
    let (leader_id, leader) = match leader_from_metrics(&metrics) {
        Some((id, node)) => (Some(id), node),
        None => (None, None),
    };
    Json(LeaderResponse {
        node_id,
        is_leader: leader_id == Some(node_id),
        leader_id,
        leader,
        term: metrics.current_term,
    })
}

async fn admin_list_peers(
    Extension(state): Extension<AppState>,
) -> Result<Json<Items<Peer>>, ApiError> {
    let items = state
        .kv
        .peers()
        .await
        .map_err(|e| ApiError::internal(format!("{e:#}")))?;
    Ok(Json(Items { items }))
}

async fn admin_add_peer(
    Extension(state): Extension<AppState>,
    uri: Uri,
    ApiJson(peer): ApiJson<Peer>,
) -> Result<Response, ApiError> {
    if peer.raft_addr.is_empty() {
        return Err(ApiError::invalid_request("raft_addr is required"));
    }
    if peer.node_id == state.kv.node_id() {
        return Err(ApiError::invalid_request("cannot add the local node as a peer"));
    }
    match state.kv.add_peer(peer.clone()).await {
        Ok(()) => Ok((StatusCode::CREATED, Json(peer)).into_response()),
        Err(err) => write_error_response(&state, &uri, err),
    }
}

async fn admin_remove_peer(
    Extension(state): Extension<AppState>,
    uri: Uri,
    Path(node_id): Path<NodeId>,
) -> Result<Response, ApiError> {
    match state.kv.remove_peer(node_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => write_error_response(&state, &uri, err),
    }
}

#[derive(Serialize)]
struct StatsResponse {
    node_id: NodeId,
    state: String,
    current_term: u64,
    leader_id: Option<NodeId>,
    last_log_index: Option<u64>,
    last_applied: Option<u64>,
    snapshot: Option<u64>,
    voters: Vec<NodeId>,
    keys: usize,
}

fn stats_from(metrics: &Metrics, keys: usize) -> StatsResponse {
    StatsResponse {
        node_id: metrics.id,
        state: format!("{:?}", metrics.state),
        current_term: metrics.current_term,
        leader_id: metrics.current_leader,
        last_log_index: metrics.last_log_index,
        last_applied: metrics.last_applied.map(|l| l.index),
        snapshot: metrics.snapshot.map(|l| l.index),
        voters: metrics.membership_config.voter_ids().collect(),
        keys,
    }
}

async fn admin_stats(Extension(state): Extension<AppState>) -> Json<StatsResponse> {
    let metrics = state.kv.metrics().borrow().clone();
    let keys = state.kv.key_count().await;
    Json(stats_from(&metrics, keys))
}

async fn admin_snapshot(
    Extension(state): Extension<AppState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .kv
        .trigger_snapshot()
        .await
        .map_err(|e| ApiError::internal(format!("{e:#}")))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "triggered" }))))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
