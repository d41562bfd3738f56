use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{api_error, ApiError};
use crate::models::{Channel, ChannelSettings};
use crate::services::normalizer::apply_settings;
use crate::AppState;

/// Query parameters for channel listing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsQuery {
    #[serde(default)]
    pub visible_only: bool,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsResponse {
    pub playlist_id: Uuid,
    pub count: usize,
    pub channels: Vec<Channel>,
}

fn store_error(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("Store error: {}", e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
}

/// Viewer order: custom order first, then channel number, then name
fn sort_for_display(channels: &mut [Channel]) {
    channels.sort_by(|a, b| {
        let order = |c: &Channel| (c.custom_order.unwrap_or(i32::MAX), c.number.unwrap_or(i32::MAX));
        order(a)
            .cmp(&order(b))
            .then_with(|| a.display_name().cmp(b.display_name()))
    });
}

/// GET /playlists/:id/channels
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChannelsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_playlist(id).await.map_err(store_error)?.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Playlist {} not found", id)));
    }

    let mut channels: Vec<Channel> = state
        .store
        .list_channels(id)
        .await
        .map_err(store_error)?
        .into_iter()
        .filter(|c| !query.visible_only || c.visible)
        .filter(|c| query.group.as_deref().map_or(true, |g| c.group == g))
        .collect();
    sort_for_display(&mut channels);

    Ok(Json(ChannelsResponse {
        playlist_id: id,
        count: channels.len(),
        channels,
    }))
}

/// PUT /playlists/:id/channels/:channel_id/settings
/// The only write path to the per-channel settings map.
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path((id, channel_id)): Path<(Uuid, String)>,
    Json(settings): Json<ChannelSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .store
        .set_channel_settings(id, &channel_id, &settings)
        .await
        .map_err(store_error)?;
    if !updated {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Playlist {} not found", id)));
    }

    // reflect the change on the stored row without waiting for the next sync
    if let Some(channel) = state
        .store
        .find_channel(id, &channel_id)
        .await
        .map_err(store_error)?
    {
        let channel = apply_settings(channel, &settings);
        state
            .store
            .upsert_channels(id, std::slice::from_ref(&channel))
            .await
            .map_err(store_error)?;
    }

    tracing::info!(playlist = %id, channel = %channel_id, visible = settings.visible, "channel settings updated");
    Ok(Json(serde_json::json!({
        "success": true,
        "channelId": channel_id,
        "settings": settings,
    })))
}
