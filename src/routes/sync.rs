use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::{api_error, ApiError};
use crate::AppState;

/// Background sync response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncResponse {
    pub status: String,
    pub playlist_id: Uuid,
    pub message: String,
}

/// POST /sync/:id - Start a background sync
/// Returns immediately; poll /sync/:id/status or follow /sync/:id/stream
pub async fn start_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get_playlist(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, format!("Playlist {} not found", id))),
        Err(e) => {
            tracing::error!("Failed to load playlist {}: {}", id, e);
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable"));
        }
    }

    if !state.tracker.try_start(id) {
        return Err(api_error(StatusCode::CONFLICT, "Sync already running"));
    }

    let task_state = state.clone();
    tokio::spawn(async move {
        tracing::info!("Background sync started for {}", id);
        if let Err(e) = task_state.tracker.execute(&task_state.sync, id).await {
            tracing::warn!("Background sync for {} ended with error: {}", id, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartSyncResponse {
            status: "syncing".to_string(),
            playlist_id: id,
            message: "Sync started in background".to_string(),
        }),
    ))
}

/// GET /sync/:id/status - Latest progress snapshot
pub async fn sync_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .tracker
        .latest(id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No sync recorded for {}", id)))
}

/// GET /sync/:id/stream - Server-sent progress events, ending after the
/// terminal (complete or failed) event
pub async fn sync_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    // subscribe before reading the snapshot so no update falls in between
    let mut events = state.tracker.subscribe();
    let snapshot = state.tracker.latest(id).await;

    let stream = stream! {
        let mut finished = false;
        if let Some(progress) = snapshot {
            finished = progress.done;
            yield Event::default().event("progress").json_data(&progress);
        }

        while !finished {
            match events.recv().await {
                Ok((playlist_id, progress)) if playlist_id == id => {
                    finished = progress.done;
                    yield Event::default().event("progress").json_data(&progress);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress stream for {} skipped {} events", id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
