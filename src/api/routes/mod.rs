pub mod admin;
pub mod chat;
pub mod health;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::GatewayError;

/// Unwrap a JSON body, rendering rejections as gateway errors.
///
/// Oversized bodies keep axum's own 413 response.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(rejection.into_response())
        }
        Err(rejection) => Err(GatewayError::from(rejection).into_response()),
    }
}
