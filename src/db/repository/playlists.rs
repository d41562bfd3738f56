//! Playlist repository for database operations

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::PlaylistRow;
use crate::models::{ChannelSettings, PlaylistStatus, SourceKind};

/// Find playlist by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<PlaylistRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaylistRow>(
        r#"
        SELECT id, name, source_kind, base_url, mac, username, password, api_path,
               portal_token, portal_secret, settings, status, last_error,
               channel_count, last_sync_at
        FROM playlists
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// List playlists, optionally by source kind
pub async fn list(pool: &PgPool, kind: Option<SourceKind>) -> Result<Vec<PlaylistRow>, sqlx::Error> {
    match kind {
        Some(kind) => {
            sqlx::query_as::<_, PlaylistRow>(
                r#"
                SELECT id, name, source_kind, base_url, mac, username, password, api_path,
                       portal_token, portal_secret, settings, status, last_error,
                       channel_count, last_sync_at
                FROM playlists
                WHERE source_kind = $1
                ORDER BY created_at
                "#,
            )
            .bind(kind.as_str())
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, PlaylistRow>(
                r#"
                SELECT id, name, source_kind, base_url, mac, username, password, api_path,
                       portal_token, portal_secret, settings, status, last_error,
                       channel_count, last_sync_at
                FROM playlists
                ORDER BY created_at
                "#,
            )
            .fetch_all(pool)
            .await
        }
    }
}

/// Find portal playlists bound to a device MAC (case-insensitive)
pub async fn find_by_mac(pool: &PgPool, mac: &str) -> Result<Vec<PlaylistRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaylistRow>(
        r#"
        SELECT id, name, source_kind, base_url, mac, username, password, api_path,
               portal_token, portal_secret, settings, status, last_error,
               channel_count, last_sync_at
        FROM playlists
        WHERE UPPER(mac) = UPPER($1)
        ORDER BY updated_at DESC
        "#,
    )
    .bind(mac)
    .fetch_all(pool)
    .await
}

/// Update sync status and error message
pub async fn set_status(
    pool: &PgPool,
    id: Uuid,
    status: PlaylistStatus,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE playlists SET
            status = $2,
            last_error = $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a completed sync
pub async fn record_sync(
    pool: &PgPool,
    id: Uuid,
    channel_count: i32,
    synced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE playlists SET
            status = 'active',
            last_error = NULL,
            channel_count = $2,
            last_sync_at = $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(channel_count)
    .bind(synced_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store the discovered API path and playback secrets for a portal playlist.
/// Existing values are kept when the new ones are NULL.
pub async fn update_portal_session(
    pool: &PgPool,
    id: Uuid,
    api_path: &str,
    token: Option<&str>,
    secret: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE playlists SET
            api_path = $2,
            portal_token = COALESCE($3, portal_token),
            portal_secret = COALESCE($4, portal_secret),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(api_path)
    .bind(token)
    .bind(secret)
    .execute(pool)
    .await?;

    Ok(())
}

/// Atomically set one key of the settings map
pub async fn set_channel_settings(
    pool: &PgPool,
    id: Uuid,
    channel_id: &str,
    settings: &ChannelSettings,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE playlists SET
            settings = jsonb_set(settings, ARRAY[$2], $3, true),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(channel_id)
    .bind(Json(settings))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
