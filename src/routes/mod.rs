pub mod channels;
pub mod health;
pub mod stream;
pub mod sync;

use axum::{
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

/// Error shape shared by the JSON handlers
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

/// Build the HTTP surface
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Health endpoints
        .route("/", get(health::root))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        .route("/ready", get(health::ready))
        .route("/live", get(health::live))
        // Sync endpoints
        .route("/sync/:id", post(sync::start_sync))
        .route("/sync/:id/status", get(sync::sync_status))
        .route("/sync/:id/stream", get(sync::sync_events))
        // Channel endpoints
        .route("/playlists/:id/channels", get(channels::list_channels))
        .route(
            "/playlists/:id/channels/:channel_id/settings",
            put(channels::update_settings),
        )
        .layer(CompressionLayer::new());

    // Media passes through untouched
    let streams = Router::new()
        .route("/stream", get(stream::open_stream))
        .route("/stream/active", get(stream::active_streams))
        .route("/stream/:mac/:channel_id", delete(stream::kill_stream));

    Router::new()
        .merge(api)
        .merge(streams)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
