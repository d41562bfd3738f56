//! Xtream Codes API Types
//!
//! Only the account and live-TV shapes are typed. Stream records stay loose
//! JSON so the normalizer can apply its field fallbacks.

use serde::{Deserialize, Serialize};

use crate::models::Playlist;

/// Xtream server and account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XtreamCredentials {
    /// Server base URL (e.g., "http://example.com:8080")
    pub server: String,
    pub username: String,
    pub password: String,
}

impl XtreamCredentials {
    pub fn new(server: &str, username: &str, password: &str) -> Self {
        Self {
            server: server.trim().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Credentials stored on an Xtream playlist
    pub fn from_playlist(playlist: &Playlist) -> Option<Self> {
        let username = playlist.username.as_deref().filter(|u| !u.is_empty())?;
        let password = playlist.password.as_deref().filter(|p| !p.is_empty())?;
        Some(Self::new(&playlist.base_url, username, password))
    }

    /// Build the player_api.php base URL
    pub fn api_url(&self) -> String {
        format!(
            "{}/player_api.php?username={}&password={}",
            self.server,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password)
        )
    }

    /// Build playback URL for live streams
    pub fn live_url(&self, stream_id: &str) -> String {
        format!(
            "{}/live/{}/{}/{}.ts",
            self.server, self.username, self.password, stream_id
        )
    }
}

// ============================================================================
// Authentication Response Types
// ============================================================================

/// Main authentication response from player_api.php (no action)
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamAuthResponse {
    pub user_info: XtreamUserInfo,
    #[serde(default)]
    pub server_info: Option<XtreamServerInfo>,
}

/// User account information
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamUserInfo {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub exp_date: Option<String>,
    #[serde(default)]
    pub max_connections: Option<String>,
}

impl XtreamUserInfo {
    /// Check if account is active
    pub fn is_active(&self) -> bool {
        let denied = matches!(&self.auth, Some(serde_json::Value::Number(n)) if n.as_i64() == Some(0));
        !denied
            && self
                .status
                .as_deref()
                .map_or(true, |s| s.eq_ignore_ascii_case("active"))
    }
}

/// Server information
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamServerInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub server_protocol: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

// ============================================================================
// Category Types
// ============================================================================

/// Live category
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamCategory {
    #[serde(deserialize_with = "string_or_number")]
    pub category_id: String,
    pub category_name: String,
}

/// Some panels send numeric ids
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
