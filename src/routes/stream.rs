use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::SourceKind;
use crate::services::gateway::{GatewayError, StreamRequest};
use crate::AppState;

/// Device id used when a request carries no MAC
const ANONYMOUS_DEVICE: &str = "anonymous";

/// Query parameters for the stream gateway
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub playlist_id: Option<Uuid>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl StreamQuery {
    fn into_request(self, range: Option<String>) -> Result<StreamRequest, GatewayError> {
        let url = non_empty(self.url);
        let kind = non_empty(self.kind)
            .map(|k| k.parse::<SourceKind>())
            .transpose()
            .map_err(GatewayError::BadRequest)?;

        // URL-only requests are keyed by the URL itself
        let channel_id = non_empty(self.channel_id)
            .or_else(|| url.clone())
            .ok_or_else(|| GatewayError::BadRequest("channelId or url is required".to_string()))?;

        Ok(StreamRequest {
            device_id: non_empty(self.mac).unwrap_or_else(|| ANONYMOUS_DEVICE.to_string()),
            channel_id,
            kind,
            playlist_id: self.playlist_id,
            url,
            range,
        })
    }
}

/// GET /stream?url=&mac=&channelId=&type=&playlistId=
/// One upstream connection per (device, channel); honors `Range`.
pub async fn open_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request = query.into_request(range)?;

    tracing::debug!(
        device = %request.device_id,
        channel = %request.channel_id,
        "stream requested"
    );
    state.gateway.open(request).await
}

/// DELETE /stream/:mac/:channel_id - Force-terminate a stream
pub async fn kill_stream(
    State(state): State<Arc<AppState>>,
    Path((mac, channel_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let success = state.gateway.kill(&mac, &channel_id);
    let message = if success {
        format!("Stream {} for {} terminated", channel_id, mac)
    } else {
        format!("No active stream {} for {}", channel_id, mac)
    };

    Json(serde_json::json!({
        "success": success,
        "message": message,
    }))
}

/// GET /stream/active - Currently piped streams
pub async fn active_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams = state.gateway.registry().list();
    Json(serde_json::json!({
        "count": streams.len(),
        "streams": streams,
    }))
}
