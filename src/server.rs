//! HTTP surface and server lifecycle.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::billing::{BillingDelta, BillingService};
use crate::db::UsageRow;
use crate::keys::{self, ApiKeyStore};
use crate::limiter::RateLimiter;
use crate::proxy;
use crate::queue::WorkQueue;
use crate::registry::ProviderRegistry;

/// Shared handles for the request path. Everything is an `Arc` or a channel
/// sender; cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<ApiKeyStore>,
    pub registry: Arc<ProviderRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub billing: Arc<BillingService>,
    pub billing_queue: WorkQueue<BillingDelta>,
    pub usage_queue: WorkQueue<UsageRow>,
}

async fn health() -> &'static str {
    "OK"
}

/// Placeholder for the metrics collaborator's handler.
async fn metrics() -> &'static str {
    ""
}

/// The chat endpoint only speaks POST; reject other methods before the
/// authentication layer runs.
async fn method_gate(request: Request, next: Next) -> Response {
    if request.uri().path() == "/v1/chat/completions" && request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({
                "error": {
                    "message": "method not allowed",
                    "type": "invalid_request_error",
                    "code": 405,
                }
            })),
        )
            .into_response();
    }
    next.run(request).await
}

pub fn app(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/models", get(proxy::list_models))
        .route("/v1/models/:model_id", get(proxy::get_model))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            keys::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(authenticated)
        .layer(middleware::from_fn(method_gate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips. Returns once every
/// in-flight connection has finished (the caller bounds the drain).
pub async fn serve(
    state: AppState,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("shutdown signalled, draining connections");
        })
        .await
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
