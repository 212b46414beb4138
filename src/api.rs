//! Health Surface
//!
//! Read-only HTTP endpoints over the reconciler's sync status, ledger
//! counts and Cloudflare reachability.

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cloudflare::CredentialRouter;
use crate::reconciler::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    /// Absent when running without Cloudflare credentials (tests)
    pub cloudflare: Option<Arc<CredentialRouter>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/overview", get(overview))
        .route("/api/containers", get(containers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(address: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!(address = %address, "API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server failed")
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.reconciler.status().await;
    let health = if status.last_error.is_some() {
        "degraded"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": health,
        "service": "labelgate",
        "version": env!("CARGO_PKG_VERSION"),
        "last_sync": status.last_sync,
    }))
}

async fn overview(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let status = state.reconciler.status().await;
    let counts = state.reconciler.resource_counts().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "error", "message": e.to_string() })),
        )
    })?;
    let resources: BTreeMap<String, _> = counts
        .into_iter()
        .map(|(kind, counts)| (kind.to_string(), counts))
        .collect();

    let cloudflare = match &state.cloudflare {
        Some(router) => Some(router.health_check().await),
        None => None,
    };
    let uptime = chrono::Utc::now() - status.started_at;

    Ok(Json(serde_json::json!({
        "sync": status,
        "resources": resources,
        "cloudflare": cloudflare,
        "uptime_secs": uptime.num_seconds(),
    })))
}

async fn containers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let containers = state.reconciler.containers().await;
    Json(serde_json::json!({
        "count": containers.len(),
        "containers": containers,
    }))
}
