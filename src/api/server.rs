//! Axum API server for the chat gateway.

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// Shared state for all API handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let shared_state = Arc::new(state);

    // No auth in front of the admin routes; the deployment is expected to
    // restrict access to them.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([HeaderName::from_static("content-type")]);

    Router::new()
        .route("/health", get(super::routes::health::get_health))
        .route("/chat", post(super::routes::chat::chat))
        .route("/chat/stream", post(super::routes::chat::chat_stream))
        .route(
            "/admin/system-prompt",
            post(super::routes::admin::set_system_prompt)
                .get(super::routes::admin::get_system_prompt)
                .delete(super::routes::admin::clear_system_prompt),
        )
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(config: &ServerConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state, config.body_limit_bytes);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Chat gateway listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Chat gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ExpiringValue;
    use crate::providers::ScriptedBackend;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_app(body_limit: usize) -> Router {
        let cache = Arc::new(ExpiringValue::new(Duration::from_secs(300)));
        let orchestrator = Orchestrator::new(Arc::new(ScriptedBackend::replying(&["ok"])), cache);
        build_router(AppState::new(orchestrator), body_limit)
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = make_app(1024).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let req = Request::builder()
            .method("GET")
            .uri("/chat")
            .body(Body::empty())
            .unwrap();
        let resp = make_app(1024).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_body_limit_enforced() {
        let big = format!(r#"{{"message":"{}"}}"#, "x".repeat(4096));
        let req = Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from(big))
            .unwrap();
        let resp = make_app(1024).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let _ = to_bytes(resp.into_body(), usize::MAX).await;
    }

    #[tokio::test]
    async fn test_start_server_stops_on_shutdown() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let cache = Arc::new(ExpiringValue::new(Duration::from_secs(300)));
        let state = AppState::new(Orchestrator::new(
            Arc::new(ScriptedBackend::replying(&[])),
            cache,
        ));
        tokio::time::timeout(
            Duration::from_secs(5),
            start_server(&config, state, async {}),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
