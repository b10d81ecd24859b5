use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use periscope_proto::SessionId;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::HubError;
use crate::sessions::{HubStats, Session};
use crate::HubState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub host_id: String,
    pub host_name: String,
}

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /sessions - create a waiting session for a host
pub async fn create_session(
    State(state): State<HubState>,
    Json(payload): Json<CreateSessionRequest>,
) -> (StatusCode, Json<Session>) {
    debug!(host = %payload.host_id, "creating session");
    let session = state
        .router
        .sessions()
        .create_session(payload.host_id, payload.host_name);
    (StatusCode::CREATED, Json(session))
}

/// GET /sessions - waiting and active sessions, newest first
pub async fn list_sessions(State(state): State<HubState>) -> Json<Vec<Session>> {
    Json(state.router.sessions().list_active())
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<HubState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Session>, HubError> {
    state
        .router
        .sessions()
        .get(&session_id)
        .map(Json)
        .ok_or(HubError::SessionNotFound(session_id))
}

/// POST /sessions/:id/end
pub async fn end_session(
    State(state): State<HubState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Session>, HubError> {
    state
        .router
        .sessions()
        .end_session(&session_id)
        .await
        .map(Json)
}

/// GET /stats
pub async fn stats(State(state): State<HubState>) -> Json<HubStats> {
    Json(state.router.sessions().stats())
}
