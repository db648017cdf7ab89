use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use postrelay::metrics;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    metrics: bool,
}

/// Serve `/metrics` and `/health` on `addr` until shutdown
pub async fn metrics_server(addr: String, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {addr}"))?;
    tracing::info!(addr = %addr, "Metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Metrics server error")?;

    Ok(())
}

/// Prometheus text exposition
async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::encode_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        metrics: metrics::metrics_initialized(),
    })
}
