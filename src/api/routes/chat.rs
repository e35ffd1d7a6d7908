//! Chat endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use super::json_body;
use crate::api::server::AppState;
use crate::orchestrator::ChatRequest;

/// POST /chat: answer in one JSON payload.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.orchestrator.chat(request).await {
        Ok(answer) => Json(json!({ "answer": answer })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /chat/stream: answer as `text/event-stream`.
///
/// Dropping the response body closes the event receiver, which cancels the
/// backend request.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    let events = match state.orchestrator.stream_chat(request).await {
        Ok(events) => events,
        Err(e) => return e.into_response(),
    };

    let stream = ReceiverStream::new(events)
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_sse())));
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
