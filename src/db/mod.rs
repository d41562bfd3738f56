//! Database module
//!
//! The core only depends on the [`ChannelStore`] contract:
//! - find playlists and channels by filter
//! - unordered bulk upsert of channels
//! - delete channels by filter (everything not in the latest sync)
//! - atomic field set on the per-channel settings map
//!
//! [`PgChannelStore`] implements it on PostgreSQL through sqlx,
//! [`MemoryStore`] keeps everything in process (tests, local runs).

pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Channel, ChannelSettings, Playlist, PlaylistStatus, SourceKind};

pub use memory::MemoryStore;
pub use pool::{create_pool, run_migrations};
pub use postgres::PgChannelStore;

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract used by the sync engine, gateway and routes
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_playlist(&self, id: Uuid) -> Result<Option<Playlist>, StoreError>;

    /// All playlists, optionally restricted to one source kind
    async fn list_playlists(&self, kind: Option<SourceKind>) -> Result<Vec<Playlist>, StoreError>;

    async fn find_channel(
        &self,
        playlist_id: Uuid,
        channel_id: &str,
    ) -> Result<Option<Channel>, StoreError>;

    /// Resolve a channel through the device MAC its portal playlist is bound to
    async fn find_channel_for_device(
        &self,
        mac: &str,
        channel_id: &str,
    ) -> Result<Option<(Playlist, Channel)>, StoreError>;

    async fn list_channels(&self, playlist_id: Uuid) -> Result<Vec<Channel>, StoreError>;

    /// Insert or update a batch keyed by (playlist, channel_id). Order is not preserved.
    async fn upsert_channels(
        &self,
        playlist_id: Uuid,
        channels: &[Channel],
    ) -> Result<u64, StoreError>;

    /// Delete every channel of the playlist whose id is not in `keep`
    async fn delete_channels_except(
        &self,
        playlist_id: Uuid,
        keep: &[String],
    ) -> Result<u64, StoreError>;

    async fn set_status(
        &self,
        id: Uuid,
        status: PlaylistStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn record_sync(
        &self,
        id: Uuid,
        channel_count: i32,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Write back portal discovery results and playback secrets
    async fn update_portal_session(
        &self,
        id: Uuid,
        api_path: &str,
        token: Option<&str>,
        secret: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Set one entry of the playlist settings map. Returns false if the playlist is unknown.
    async fn set_channel_settings(
        &self,
        id: Uuid,
        channel_id: &str,
        settings: &ChannelSettings,
    ) -> Result<bool, StoreError>;

    async fn ping(&self) -> bool;
}
