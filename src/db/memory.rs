//! In-process channel store
//!
//! Same semantics as the PostgreSQL store. Used by tests and for running
//! the gateway without a database (`DATABASE_URL=memory`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{ChannelStore, StoreError};
use crate::models::{Channel, ChannelSettings, Playlist, PlaylistStatus, SourceKind};

#[derive(Default)]
pub struct MemoryStore {
    playlists: RwLock<HashMap<Uuid, Playlist>>,
    channels: RwLock<HashMap<Uuid, BTreeMap<String, Channel>>>,
    upsert_calls: AtomicUsize,
    /// Fail every upsert after this many successful calls
    fail_upserts_after: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that starts rejecting upserts once `n` batches were written
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_upserts_after: Some(n),
            ..Self::default()
        }
    }

    pub async fn insert_playlist(&self, playlist: Playlist) {
        self.playlists.write().await.insert(playlist.id, playlist);
    }

    /// Number of upsert batches received so far
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn get_playlist(&self, id: Uuid) -> Result<Option<Playlist>, StoreError> {
        Ok(self.playlists.read().await.get(&id).cloned())
    }

    async fn list_playlists(&self, kind: Option<SourceKind>) -> Result<Vec<Playlist>, StoreError> {
        let playlists = self.playlists.read().await;
        Ok(playlists
            .values()
            .filter(|p| kind.map_or(true, |k| p.source_kind == k))
            .cloned()
            .collect())
    }

    async fn find_channel(
        &self,
        playlist_id: Uuid,
        channel_id: &str,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(self
            .channels
            .read()
            .await
            .get(&playlist_id)
            .and_then(|c| c.get(channel_id))
            .cloned())
    }

    async fn find_channel_for_device(
        &self,
        mac: &str,
        channel_id: &str,
    ) -> Result<Option<(Playlist, Channel)>, StoreError> {
        let candidates: Vec<Playlist> = self
            .playlists
            .read()
            .await
            .values()
            .filter(|p| p.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(mac)))
            .cloned()
            .collect();

        for playlist in candidates {
            if let Some(channel) = self.find_channel(playlist.id, channel_id).await? {
                return Ok(Some((playlist, channel)));
            }
        }
        Ok(None)
    }

    async fn list_channels(&self, playlist_id: Uuid) -> Result<Vec<Channel>, StoreError> {
        let mut list: Vec<Channel> = self
            .channels
            .read()
            .await
            .get(&playlist_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| {
            (a.custom_order.unwrap_or(i32::MAX), a.number.unwrap_or(i32::MAX), &a.name).cmp(&(
                b.custom_order.unwrap_or(i32::MAX),
                b.number.unwrap_or(i32::MAX),
                &b.name,
            ))
        });
        Ok(list)
    }

    async fn upsert_channels(
        &self,
        playlist_id: Uuid,
        batch: &[Channel],
    ) -> Result<u64, StoreError> {
        let calls = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_upserts_after {
            if calls >= limit {
                return Err(StoreError::Unavailable("write rejected".to_string()));
            }
        }

        let mut channels = self.channels.write().await;
        let entry = channels.entry(playlist_id).or_default();
        for channel in batch {
            entry.insert(channel.channel_id.clone(), channel.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn delete_channels_except(
        &self,
        playlist_id: Uuid,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut channels = self.channels.write().await;
        let Some(entry) = channels.get_mut(&playlist_id) else {
            return Ok(0);
        };
        let before = entry.len();
        entry.retain(|id, _| keep.contains(id.as_str()));
        Ok((before - entry.len()) as u64)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: PlaylistStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(playlist) = self.playlists.write().await.get_mut(&id) {
            playlist.status = status;
            playlist.last_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_sync(
        &self,
        id: Uuid,
        channel_count: i32,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(playlist) = self.playlists.write().await.get_mut(&id) {
            playlist.status = PlaylistStatus::Active;
            playlist.last_error = None;
            playlist.channel_count = channel_count;
            playlist.last_sync_at = Some(synced_at);
        }
        Ok(())
    }

    async fn update_portal_session(
        &self,
        id: Uuid,
        api_path: &str,
        token: Option<&str>,
        secret: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(playlist) = self.playlists.write().await.get_mut(&id) {
            playlist.api_path = Some(api_path.to_string());
            if let Some(token) = token {
                playlist.portal_token = Some(token.to_string());
            }
            if let Some(secret) = secret {
                playlist.portal_secret = Some(secret.to_string());
            }
        }
        Ok(())
    }

    async fn set_channel_settings(
        &self,
        id: Uuid,
        channel_id: &str,
        settings: &ChannelSettings,
    ) -> Result<bool, StoreError> {
        match self.playlists.write().await.get_mut(&id) {
            Some(playlist) => {
                playlist
                    .settings
                    .insert(channel_id.to_string(), settings.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}
