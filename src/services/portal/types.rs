//! Portal protocol types

use serde::Serialize;
use std::collections::HashMap;

/// Genre id → display title
pub type GenreMap = HashMap<String, String>;

/// Portal client failures
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(u16),
    /// Every strategy was tried and none produced a usable result
    #[error("portal exhausted: {0}")]
    Exhausted(String),
}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        PortalError::Network(err.to_string())
    }
}

/// Outcome of path discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPath {
    pub path: String,
    pub token: Option<String>,
}

/// Result of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeToken {
    Token(String),
    /// Portal serves requests without a session token
    NotRequired,
}

impl HandshakeToken {
    pub fn token(&self) -> Option<&str> {
        match self {
            HandshakeToken::Token(t) => Some(t),
            HandshakeToken::NotRequired => None,
        }
    }
}

/// Subset of `get_profile` the gateway relies on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalProfile {
    /// Streaming secret (`password` field)
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub account_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    /// True when the profile could not be fetched
    pub offline: bool,
}

impl PortalProfile {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }
}

/// Subset of `account_info/get_main_info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub mac: Option<String>,
    pub phone: Option<String>,
    pub expires: Option<String>,
    pub tariff_plan: Option<String>,
    pub offline: bool,
}

/// Where a playback URL came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    /// Fresh `create_link` answer
    Portal,
    /// URL embedded in the stored command
    Command,
    /// Built from the `play/live.php` convention
    Synthesized,
}

/// Playable URL for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackLink {
    pub url: String,
    pub source: LinkSource,
}
