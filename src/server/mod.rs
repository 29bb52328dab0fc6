//! HTTP server
//!
//! One axum router for the gateway webhook and the operations API the
//! dashboard consumes. Every error leaves as `{ "error", "code" }` with the
//! status from [`SyncError::http_status`].

mod handlers;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::SyncError;
use crate::services::ServiceContext;

/// Upper bound on one webhook delivery, parsing and applying included.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 30;

pub type AppState = Arc<ServiceContext>;

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the full router over `state`.
pub fn router(state: AppState) -> Router {
    let max_body = state.config.server.max_body_bytes;

    // Deliveries are bounded in time; a full sync on the operations side is
    // bounded by its page limit instead.
    let webhook = Router::new()
        .route("/webhook", post(handlers::webhook))
        .route("/webhook/:event", post(handlers::webhook_by_event))
        .layer(TimeoutLayer::new(Duration::from_secs(WEBHOOK_TIMEOUT_SECS)));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/gateway/probe", get(handlers::probe))
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route("/instances/:name", get(handlers::show_instance))
        .route("/instances/:name/reconnect", post(handlers::reconnect))
        .route("/instances/:name/refresh", post(handlers::refresh))
        .route("/instances/:name/sync", post(handlers::full_sync))
        .route(
            "/instances/:name/conversations",
            get(handlers::list_conversations),
        )
        .route(
            "/instances/:name/conversations/:jid/messages",
            get(handlers::messages_by_jid),
        )
        .route("/conversations/:id/messages", get(handlers::messages_by_id))
        .merge(webhook)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    if !state.auth.is_configured() {
        tracing::warn!("Webhook secret not configured; all deliveries will be rejected");
    }
    tracing::info!(
        "Listening on {} (webhook URL {})",
        addr,
        state.config.server.webhook_url()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
