//! Metrics and health HTTP endpoints.
//!
//! `GET /metrics` returns a JSON snapshot of the proxy counters;
//! `GET /health` reports liveness. Served beside the gRPC port when
//! metrics are enabled.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::metrics::{MetricsSnapshot, ProxyMetrics};

pub fn router(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_snapshot))
        .route("/health", get(health))
        .with_state(metrics)
}

async fn metrics_snapshot(State(metrics): State<Arc<ProxyMetrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Serve the endpoints until `shutdown` resolves.
pub async fn serve<F>(
    metrics: Arc<ProxyMetrics>,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");
    axum::serve(listener, router(metrics).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_snapshot_handler() {
        let metrics = Arc::new(ProxyMetrics::new());
        metrics.inc_active_producers();
        metrics.inc_messages_sent();

        let Json(snapshot) = metrics_snapshot(State(metrics)).await;
        assert_eq!(snapshot.active_producers, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.error_count, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
        assert!(body["time"].is_string());
    }
}
