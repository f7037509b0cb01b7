//! Status endpoints for probes and operators.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tokio::sync::watch;

use crate::metrics::{StatusReport, WorkerMetrics};

pub fn router(metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_report))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(metrics)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_report(State(metrics): State<Arc<WorkerMetrics>>) -> Json<StatusReport> {
    Json(metrics.report().await)
}

/// Serves the status endpoints until `shutdown` flips.
pub async fn serve(
    port: u16,
    metrics: Arc<WorkerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Status server listening on http://{}", addr);

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
