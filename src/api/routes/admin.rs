//! System prompt administration.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::json_body;
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SetPromptRequest {
    pub prompt: String,
}

/// POST /admin/system-prompt: replace the cached prompt and reset its TTL.
pub async fn set_system_prompt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SetPromptRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.orchestrator.set_system_prompt(&request.prompt) {
        Ok(()) => Json(json!({ "status": "ok", "message": "system prompt cached" })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /admin/system-prompt: whether a prompt is cached and for how long.
pub async fn get_system_prompt(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.orchestrator.system_prompt_status();
    Json(json!({
        "cached": status.cached,
        "expires_in_secs": status.expires_in_secs,
        "expires_at": status.expires_at,
    }))
}

/// DELETE /admin/system-prompt: drop the cached prompt.
pub async fn clear_system_prompt(State(state): State<Arc<AppState>>) -> StatusCode {
    state.orchestrator.clear_system_prompt();
    StatusCode::NO_CONTENT
}
