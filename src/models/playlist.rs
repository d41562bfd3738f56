use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Upstream delivery mechanism of a playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Portal,
    Xtream,
    M3u,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Portal => "portal",
            SourceKind::Xtream => "xtream",
            SourceKind::M3u => "m3u",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "portal" | "stalker" | "mag" => Ok(SourceKind::Portal),
            "xtream" | "xtream-codes" | "xc" => Ok(SourceKind::Xtream),
            "m3u" | "m3u8" | "playlist" => Ok(SourceKind::M3u),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Sync lifecycle of a playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistStatus {
    Idle,
    Syncing,
    Active,
    Error,
}

impl PlaylistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistStatus::Idle => "idle",
            PlaylistStatus::Syncing => "syncing",
            PlaylistStatus::Active => "active",
            PlaylistStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => PlaylistStatus::Syncing,
            "active" => PlaylistStatus::Active,
            "error" => PlaylistStatus::Error,
            _ => PlaylistStatus::Idle,
        }
    }
}

/// Per-channel user overrides stored on the playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSettings {
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_order: Option<i32>,
}

fn default_visible() -> bool {
    true
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            visible: true,
            custom_name: None,
            custom_logo: None,
            custom_order: None,
        }
    }
}

/// A configured upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: Uuid,
    pub name: String,
    pub source_kind: SourceKind,
    /// Portal base URL, Xtream server URL or M3U playlist URL
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Portal API path found by discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_path: Option<String>,
    #[serde(skip_serializing)]
    pub portal_token: Option<String>,
    #[serde(skip_serializing)]
    pub portal_secret: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, ChannelSettings>,
    pub status: PlaylistStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub channel_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Playlist {
    /// Stored overrides for a channel, or defaults (visible) for new channels
    pub fn settings_for(&self, channel_id: &str) -> ChannelSettings {
        self.settings.get(channel_id).cloned().unwrap_or_default()
    }
}

/// Canonical cross-vendor channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Unique within the owning playlist
    pub channel_id: String,
    /// Identifier as reported by the upstream, when it reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<i32>,
    /// Playback command (portal) or literal stream URL (xtream/m3u)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Streaming secret, kept verbatim
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Sample playback URL embedded in the upstream record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_url: Option<String>,
    pub visible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_logo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_order: Option<i32>,
}

impl Channel {
    /// Name shown to viewers (custom override first)
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }

    pub fn display_logo(&self) -> Option<&str> {
        self.custom_logo.as_deref().or(self.logo.as_deref())
    }
}
