//! Error types for the chat gateway.
//!
//! Every failure that can reach a client maps onto one [`GatewayError`]
//! variant, so the HTTP layer and the stream relay can tell retryable backend
//! outages apart from requests the backend will never accept.

use thiserror::Error;

/// Errors produced by the gateway pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request was rejected before any backend call was attempted.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend could not be reached, timed out, or is overloaded.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend refused the input (invalid, oversized, or blocked).
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// The client or the backend went away in the middle of a stream.
    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The user-context collaborator failed.
    #[error("User context lookup failed: {0}")]
    Context(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable machine-readable name used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendRejected(_) => "backend_rejected",
            Self::StreamAborted(_) => "stream_aborted",
            Self::Config(_) => "config",
            Self::Context(_) => "context",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::StreamAborted(_))
    }

    /// HTTP status code surfaced to clients for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::Json(_) => 400,
            Self::BackendUnavailable(_) | Self::BackendRejected(_) => 502,
            _ => 500,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures never carry a usable backend verdict.
        Self::BackendUnavailable(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Map a non-success backend HTTP status onto the error taxonomy.
///
/// Client-side statuses (bad input, auth, unknown model, payload too large)
/// are final; rate limiting and server-side statuses are retryable.
pub fn parse_backend_error(status: u16, message: &str) -> GatewayError {
    match status {
        400 | 401 | 403 | 404 | 413 | 422 => {
            GatewayError::BackendRejected(format!("HTTP {status}: {message}"))
        }
        _ => GatewayError::BackendUnavailable(format!("HTTP {status}: {message}")),
    }
}
