use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use periscope_proto::{ConnectionId, SessionId};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} has ended")]
    SessionEnded(SessionId),
    #[error("connection {0} has not joined a session")]
    NotInSession(ConnectionId),
    /// The session's actor is gone; only seen while a session is being swept.
    #[error("session {0} is unavailable")]
    SessionUnavailable(SessionId),
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            HubError::UnknownConnection(_) | HubError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            HubError::SessionEnded(_) => StatusCode::CONFLICT,
            HubError::NotInSession(_) => StatusCode::BAD_REQUEST,
            HubError::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
