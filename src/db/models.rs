//! Database row types for PostgreSQL
//!
//! These map directly to rows and convert into the domain types in `models`.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::{Channel, ChannelSettings, Playlist, PlaylistStatus, SourceKind};

/// Playlist row from database
#[derive(Debug, Clone, FromRow)]
pub struct PlaylistRow {
    pub id: Uuid,
    pub name: String,
    pub source_kind: String,
    pub base_url: String,
    pub mac: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_path: Option<String>,
    pub portal_token: Option<String>,
    pub portal_secret: Option<String>,
    pub settings: Json<HashMap<String, ChannelSettings>>,
    pub status: String,
    pub last_error: Option<String>,
    pub channel_count: i32,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl TryFrom<PlaylistRow> for Playlist {
    type Error = StoreError;

    fn try_from(row: PlaylistRow) -> Result<Self, Self::Error> {
        let source_kind: SourceKind = row.source_kind.parse().map_err(StoreError::Corrupt)?;

        Ok(Playlist {
            id: row.id,
            name: row.name,
            source_kind,
            base_url: row.base_url,
            mac: row.mac,
            username: row.username,
            password: row.password,
            api_path: row.api_path,
            portal_token: row.portal_token,
            portal_secret: row.portal_secret,
            settings: row.settings.0,
            status: PlaylistStatus::parse(&row.status),
            last_error: row.last_error,
            channel_count: row.channel_count,
            last_sync_at: row.last_sync_at,
        })
    }
}

/// Channel row from database
#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel_id: String,
    pub native_id: Option<String>,
    pub name: String,
    pub logo: Option<String>,
    pub group_name: String,
    pub channel_number: Option<i32>,
    pub cmd: Option<String>,
    pub secret: Option<String>,
    pub sample_url: Option<String>,
    pub visible: bool,
    pub custom_name: Option<String>,
    pub custom_logo: Option<String>,
    pub custom_order: Option<i32>,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            channel_id: row.channel_id,
            native_id: row.native_id,
            name: row.name,
            logo: row.logo,
            group: row.group_name,
            number: row.channel_number,
            cmd: row.cmd,
            secret: row.secret,
            sample_url: row.sample_url,
            visible: row.visible,
            custom_name: row.custom_name,
            custom_logo: row.custom_logo,
            custom_order: row.custom_order,
        }
    }
}

/// Convert a batch of rows, failing on the first corrupt one
pub fn playlists_from_rows(rows: Vec<PlaylistRow>) -> Result<Vec<Playlist>, StoreError> {
    rows.into_iter().map(Playlist::try_from).collect()
}
