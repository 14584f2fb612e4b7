//! Route handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::AppState;
use crate::session::{SessionSnapshot, SessionStatus};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, alias = "userId")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub auth_code: Option<String>,
    pub status: SessionStatus,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, alias = "userId")]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default, alias = "message")]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    #[serde(default, alias = "userId")]
    pub id: Option<String>,
}

/// Status of one session. `identity` and `authCode` are only reported
/// for registered sessions.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub status: SessionStatus,
    #[serde(flatten)]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    pub identity: Option<String>,
    pub auth_code: Option<String>,
}

impl StatusResponse {
    fn absent() -> Self {
        Self {
            connected: false,
            status: SessionStatus::Disconnected,
            details: None,
        }
    }
}

impl From<SessionSnapshot> for StatusResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            connected: snapshot.is_connected(),
            status: snapshot.status,
            details: Some(StatusDetails {
                identity: snapshot.identity,
                auth_code: snapshot.auth_code,
            }),
        }
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, ApiError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::bad_request(format!("{} is required", field))),
    }
}

/// POST /generate-qr
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let Json(request) = payload?;
    let id = required("id", request.id)?;

    let session = state.registry.get_or_create(&id).await?;
    let snapshot = session.wait_until_settled(state.auth_wait).await;
    debug!("Session {} settled as {}", id, snapshot.status);

    Ok(Json(CreateSessionResponse {
        auth_code: snapshot.auth_code,
        status: snapshot.status,
    }))
}

/// GET /status/{id}
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<StatusResponse> {
    let response = match state.registry.get(&id) {
        Some(session) => StatusResponse::from(session.snapshot()),
        None => StatusResponse::absent(),
    };
    Json(response)
}

/// POST /send-message
pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let id = required("id", request.id)?;
    let to = required("to", request.to)?;
    let text = request
        .text
        .ok_or_else(|| ApiError::bad_request("text is required"))?;

    state.registry.send_text(&id, &to, &text).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /disconnect
pub async fn disconnect(
    State(state): State<AppState>,
    payload: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let id = required("id", request.id)?;

    state.registry.disconnect(&id).await?;
    info!("Session {} disconnected via API", id);
    Ok(Json(json!({ "success": true })))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.registry.list())
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
