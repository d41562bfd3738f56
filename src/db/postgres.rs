//! PostgreSQL implementation of the channel store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::playlists_from_rows;
use crate::db::repository::{channels, playlists};
use crate::db::{pool, ChannelStore, StoreError};
use crate::models::{Channel, ChannelSettings, Playlist, PlaylistStatus, SourceKind};

#[derive(Clone)]
pub struct PgChannelStore {
    pool: PgPool,
}

impl PgChannelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelStore for PgChannelStore {
    async fn get_playlist(&self, id: Uuid) -> Result<Option<Playlist>, StoreError> {
        playlists::find_by_id(&self.pool, id)
            .await?
            .map(Playlist::try_from)
            .transpose()
    }

    async fn list_playlists(&self, kind: Option<SourceKind>) -> Result<Vec<Playlist>, StoreError> {
        playlists_from_rows(playlists::list(&self.pool, kind).await?)
    }

    async fn find_channel(
        &self,
        playlist_id: Uuid,
        channel_id: &str,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(channels::find(&self.pool, playlist_id, channel_id)
            .await?
            .map(Into::into))
    }

    async fn find_channel_for_device(
        &self,
        mac: &str,
        channel_id: &str,
    ) -> Result<Option<(Playlist, Channel)>, StoreError> {
        for playlist in playlists_from_rows(playlists::find_by_mac(&self.pool, mac).await?)? {
            if let Some(row) = channels::find(&self.pool, playlist.id, channel_id).await? {
                return Ok(Some((playlist, row.into())));
            }
        }
        Ok(None)
    }

    async fn list_channels(&self, playlist_id: Uuid) -> Result<Vec<Channel>, StoreError> {
        let rows = channels::list_by_playlist(&self.pool, playlist_id).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_channels(
        &self,
        playlist_id: Uuid,
        batch: &[Channel],
    ) -> Result<u64, StoreError> {
        Ok(channels::upsert_batch(&self.pool, playlist_id, batch).await?)
    }

    async fn delete_channels_except(
        &self,
        playlist_id: Uuid,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        Ok(channels::delete_except(&self.pool, playlist_id, keep).await?)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: PlaylistStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(playlists::set_status(&self.pool, id, status, error).await?)
    }

    async fn record_sync(
        &self,
        id: Uuid,
        channel_count: i32,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(playlists::record_sync(&self.pool, id, channel_count, synced_at).await?)
    }

    async fn update_portal_session(
        &self,
        id: Uuid,
        api_path: &str,
        token: Option<&str>,
        secret: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(playlists::update_portal_session(&self.pool, id, api_path, token, secret).await?)
    }

    async fn set_channel_settings(
        &self,
        id: Uuid,
        channel_id: &str,
        settings: &ChannelSettings,
    ) -> Result<bool, StoreError> {
        let affected = playlists::set_channel_settings(&self.pool, id, channel_id, settings).await?;
        Ok(affected > 0)
    }

    async fn ping(&self) -> bool {
        pool::health_check(&self.pool).await
    }
}
