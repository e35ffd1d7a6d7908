//! User context served by an HTTP collaborator.
//!
//! `GET <base_url>/<user_id>` returning a JSON body. A 404 means the user has
//! no context.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::UserContextLookup;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct HttpContextLookup {
    base_url: String,
    client: reqwest::Client,
}

impl HttpContextLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, user_id: &str) -> String {
        format!("{}/{}", self.base_url, encode_segment(user_id))
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl UserContextLookup for HttpContextLookup {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_user_context(&self, user_id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(self.url_for(user_id))
            .send()
            .await
            .map_err(|e| GatewayError::Context(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayError::Context(format!(
                "context service returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Context(format!("invalid context body: {e}")))?;
        Ok(match body {
            Value::Null => None,
            other => Some(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve_contexts() -> String {
        async fn lookup(Path(user_id): Path<String>) -> std::result::Result<Json<Value>, StatusCode> {
            match user_id.as_str() {
                "alice" => Ok(Json(json!({ "plan": "gold" }))),
                "broken" => Err(StatusCode::INTERNAL_SERVER_ERROR),
                _ => Err(StatusCode::NOT_FOUND),
            }
        }

        let app = Router::new().route("/users/{user_id}", get(lookup));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/users/")
    }

    #[test]
    fn test_url_for_encodes_user_id() {
        let lookup = HttpContextLookup::new("http://ctx.local/users/", Duration::from_secs(1)).unwrap();
        assert_eq!(lookup.url_for("u-1"), "http://ctx.local/users/u-1");
        assert_eq!(lookup.url_for("a/b c"), "http://ctx.local/users/a%2Fb%20c");
    }

    #[tokio::test]
    async fn test_fetch_found_missing_and_failing() {
        let base = serve_contexts().await;
        let lookup = HttpContextLookup::new(&base, Duration::from_secs(5)).unwrap();

        let found = lookup.fetch_user_context("alice").await.unwrap();
        assert_eq!(found, Some(json!({ "plan": "gold" })));

        assert!(lookup.fetch_user_context("nobody").await.unwrap().is_none());

        let err = lookup.fetch_user_context("broken").await.unwrap_err();
        assert!(matches!(err, GatewayError::Context(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_context_error() {
        let lookup = HttpContextLookup::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = lookup.fetch_user_context("alice").await.unwrap_err();
        assert!(matches!(err, GatewayError::Context(_)));
    }
}
