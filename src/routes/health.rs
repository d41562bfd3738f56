use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

/// Root endpoint - basic status
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Channel Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "runtime": "rust"
    }))
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    store: bool,
    /// Absent when no Redis mirror is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    redis: Option<bool>,
    active_streams: usize,
}

async fn redis_ok(state: &AppState) -> Option<bool> {
    match &state.redis {
        Some(redis) => Some(redis.ping().await.unwrap_or(false)),
        None => None,
    }
}

/// GET /health - Advanced health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let store_ok = state.store.ping().await;
    let redis = redis_ok(&state).await;

    // Redis only mirrors progress; the store is critical
    let status = match (store_ok, redis) {
        (true, Some(false)) => "degraded",
        (true, _) => "ok",
        (false, _) => "unhealthy",
    };

    Json(HealthResponse {
        status: status.to_string(),
        uptime,
        store: store_ok,
        redis,
        active_streams: state.gateway.registry().len(),
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                b"Internal Server Error".to_vec(),
            )
        }
    }
}

/// Readiness probe (for Kubernetes)
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.ping().await;
    let redis = redis_ok(&state).await;

    match (store_ok, redis) {
        (true, Some(false)) => (StatusCode::OK, "ready (redis degraded)"),
        (true, _) => (StatusCode::OK, "ready"),
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "not ready - store unavailable"),
    }
}

/// Liveness probe (for Kubernetes)
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}
