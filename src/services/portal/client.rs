//! Portal (STB middleware) client
//!
//! Speaks the set-top-box protocol: API path discovery, handshake, profile,
//! genre and channel listing, link creation and stream release. Every call
//! that can be answered in more than one way walks an ordered fallback list.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::*;
use crate::services::codec::{decode, scalar_string, Decoded};
use crate::services::fallback::{first_success, Attempt};
use crate::services::normalizer::native_id;

/// API paths tried in order during discovery
pub const CANDIDATE_PATHS: &[&str] = &[
    "/portal.php",
    "/server/load.php",
    "/stalker_portal/server/load.php",
    "/c/portal.php",
    "/stalker_portal/c/portal.php",
];

/// Path used when discovery finds nothing
pub const DEFAULT_PATH: &str = "/portal.php";

/// Bulk listing actions tried before falling back to per-genre listing
pub const LISTING_ACTIONS: &[&str] = &["get_all_channels", "get_ordered_list", "get_all_items"];

/// Player prefixes portals put in front of the stream URL
const COMMAND_PREFIXES: &[&str] = &["ffmpeg ", "ffrt3 ", "ffrt2 ", "ffrt ", "auto "];

/// Safety cap for `get_ordered_list` pagination
const MAX_PAGES: u32 = 200;

pub const X_USER_AGENT: &str = "Model: MAG250; Link: WiFi";

lazy_static! {
    static ref STREAM_URL_REGEX: Regex =
        Regex::new(r#"(?i)\b(?:https?|rtmp|rtsp|rtp|udp)://[^\s"'<>]+"#).unwrap();
}

/// Strip a trailing API path or `/c` from a configured portal URL
pub fn normalize_base_url(url: &str) -> String {
    let mut base = url.trim().trim_end_matches('/').to_string();
    loop {
        let stripped = ["/portal.php", "/server/load.php", "/load.php", "/c"]
            .iter()
            .find_map(|suffix| base.strip_suffix(suffix).map(str::to_string));
        match stripped {
            Some(rest) => base = rest.trim_end_matches('/').to_string(),
            None => return base,
        }
    }
}

/// First well-formed stream URL inside a portal command
pub fn extract_stream_url(cmd: &str) -> Option<String> {
    let mut rest = cmd.trim();
    while let Some(stripped) = COMMAND_PREFIXES.iter().find_map(|p| rest.strip_prefix(p)) {
        rest = stripped.trim_start();
    }
    STREAM_URL_REGEX
        .find(rest)
        .map(|m| m.as_str().to_string())
        .filter(|u| url::Url::parse(u).is_ok())
}

/// Commands stored at listing time often point at a loopback placeholder
fn is_placeholder(stream_url: &str) -> bool {
    url::Url::parse(stream_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| host == "localhost" || host == "127.0.0.1")
}

/// Drop records whose native id was already seen; id-less records are kept
fn dedupe(records: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| native_id(record).map_or(true, |id| seen.insert(id)))
        .collect()
}

/// Portal client bound to one (portal, MAC) pair
pub struct PortalClient {
    http: Client,
    base_url: String,
    mac: String,
    user_agent: String,
    timeout: Duration,
    api_path: Option<String>,
    token: Option<String>,
}

impl PortalClient {
    pub fn new(http: Client, base_url: &str, mac: &str, user_agent: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
            mac: mac.trim().to_uppercase(),
            user_agent: user_agent.to_string(),
            timeout,
            api_path: None,
            token: None,
        }
    }

    /// Seed a previously discovered path and token
    pub fn with_session(mut self, api_path: Option<String>, token: Option<String>) -> Self {
        self.api_path = api_path;
        self.token = token;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_path(&self) -> Option<&str> {
        self.api_path.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn cookie(&self) -> String {
        format!(
            "mac={}; stb_lang=en; timezone=Europe%2FLondon",
            urlencoding::encode(&self.mac)
        )
    }

    async fn request_with(
        &self,
        path: &str,
        params: &[(&str, &str)],
        token: Option<&str>,
    ) -> Result<Decoded, PortalError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .query(params)
            .query(&[("JsHttpRequest", "1-xml")])
            .header("User-Agent", self.user_agent.as_str())
            .header("X-User-Agent", X_USER_AGENT)
            .header("Cookie", self.cookie())
            .header("Referer", format!("{}/c/", self.base_url))
            .header("Accept", "*/*");
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortalError::Http(status.as_u16()));
        }

        let body = response.text().await?;
        Ok(decode(&body))
    }

    /// Request against the discovered path (or the default) with the session token
    async fn request(&self, params: &[(&str, &str)]) -> Result<Decoded, PortalError> {
        let path = self.api_path.as_deref().unwrap_or(DEFAULT_PATH);
        self.request_with(path, params, self.token.as_deref()).await
    }

    async fn handshake_at(&self, path: &str) -> Result<Decoded, PortalError> {
        self.request_with(
            path,
            &[("type", "stb"), ("action", "handshake"), ("token", "")],
            None,
        )
        .await
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Try each candidate path in order and cache the first one that hands out
    /// a token. Falls back to [`DEFAULT_PATH`] without a token.
    pub async fn discover_path(&mut self) -> DiscoveredPath {
        let this = &*self;
        let found = first_success(CANDIDATE_PATHS.to_vec(), |path| {
            async move {
                Attempt::from(
                    this.handshake_at(path)
                        .await
                        .map(|decoded| decoded.find_str("token")),
                )
            }
            .boxed()
        })
        .await;

        let discovered = match found {
            Some((path, token)) => {
                info!(base_url = %self.base_url, path, "portal API path discovered");
                DiscoveredPath {
                    path: path.to_string(),
                    token: Some(token),
                }
            }
            None => {
                warn!(base_url = %self.base_url, "no candidate path answered the handshake, using default");
                DiscoveredPath {
                    path: DEFAULT_PATH.to_string(),
                    token: None,
                }
            }
        };

        self.api_path = Some(discovered.path.clone());
        self.token = discovered.token.clone();
        discovered
    }

    /// Handshake on the cached path, rediscovering when it stops answering
    pub async fn handshake(&mut self) -> HandshakeToken {
        if let Some(path) = self.api_path.clone() {
            match self.handshake_at(&path).await {
                Ok(decoded @ Decoded::Json(_)) => {
                    let token = decoded.find_str("token");
                    self.token = token.clone();
                    return token.map_or(HandshakeToken::NotRequired, HandshakeToken::Token);
                }
                Ok(Decoded::Opaque(_)) => {
                    debug!(path = %path, "cached portal path answered with non-JSON, rediscovering");
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "cached portal path failed, rediscovering");
                }
            }
        }

        self.discover_path()
            .await
            .token
            .map_or(HandshakeToken::NotRequired, HandshakeToken::Token)
    }

    /// Device profile; carries the streaming secret
    pub async fn get_profile(&self) -> PortalProfile {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let params = [
            ("type", "stb"),
            ("action", "get_profile"),
            ("hd", "1"),
            ("stb_type", "MAG250"),
            ("image_version", "218"),
            ("num_banks", "2"),
            ("auth_second_step", "1"),
            ("not_valid_token", "0"),
            ("timestamp", timestamp.as_str()),
        ];

        match self.request(&params).await {
            Ok(decoded) if decoded.payload().is_some_and(Value::is_object) => PortalProfile {
                secret: decoded.find_str("password"),
                account_id: decoded.find_str("id"),
                name: decoded.find_str("fname").or_else(|| decoded.find_str("name")),
                status: decoded.find_str("status"),
                offline: false,
            },
            Ok(_) => {
                warn!(base_url = %self.base_url, "portal profile answer was not an object");
                PortalProfile::offline()
            }
            Err(e) => {
                warn!(base_url = %self.base_url, error = %e, "portal profile unavailable");
                PortalProfile::offline()
            }
        }
    }

    pub async fn get_account_info(&self) -> AccountInfo {
        match self
            .request(&[("type", "account_info"), ("action", "get_main_info")])
            .await
        {
            Ok(decoded @ Decoded::Json(_)) => AccountInfo {
                mac: decoded.find_str("mac"),
                phone: decoded.find_str("phone"),
                expires: decoded
                    .find_str("end_date")
                    .or_else(|| decoded.find_str("expire_billing_date")),
                tariff_plan: decoded.find_str("tariff_plan"),
                offline: false,
            },
            Ok(Decoded::Opaque(_)) => AccountInfo {
                offline: true,
                ..AccountInfo::default()
            },
            Err(e) => {
                debug!(error = %e, "account info unavailable");
                AccountInfo {
                    offline: true,
                    ..AccountInfo::default()
                }
            }
        }
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Genre id → title, without the catch-all `*` entry
    pub async fn get_genres(&self) -> GenreMap {
        match self.request(&[("type", "itv"), ("action", "get_genres")]).await {
            Ok(decoded) => decoded
                .records()
                .iter()
                .filter_map(|genre| {
                    let id = genre.get("id").and_then(scalar_string)?;
                    if id == "*" {
                        return None;
                    }
                    let title = genre
                        .get("title")
                        .or_else(|| genre.get("name"))
                        .and_then(scalar_string)
                        .unwrap_or_else(|| id.clone());
                    Some((id, title))
                })
                .collect(),
            Err(e) => {
                warn!(base_url = %self.base_url, error = %e, "genre listing failed");
                GenreMap::new()
            }
        }
    }

    /// Every page of `get_ordered_list` for one genre
    async fn fetch_genre_pages(&self, genre: &str) -> Result<Vec<Value>, PortalError> {
        let mut all = Vec::new();

        for page in 1..=MAX_PAGES {
            let p = page.to_string();
            let params = [
                ("type", "itv"),
                ("action", "get_ordered_list"),
                ("genre", genre),
                ("force_ch_link_check", ""),
                ("fav", "0"),
                ("sortby", "number"),
                ("p", p.as_str()),
            ];

            let decoded = match self.request(&params).await {
                Ok(decoded) => decoded,
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    warn!(genre, page, error = %e, "stopping pagination early");
                    break;
                }
            };

            let records = decoded.records();
            if records.is_empty() {
                break;
            }
            all.extend(records);

            match decoded.payload_u64("total_items") {
                Some(total) if all.len() as u64 >= total => break,
                Some(_) => {}
                // unpaged answer
                None => break,
            }
        }

        Ok(all)
    }

    async fn fetch_listing(&self, action: &str) -> Result<Vec<Value>, PortalError> {
        match action {
            "get_ordered_list" => self.fetch_genre_pages("*").await,
            _ => Ok(self
                .request(&[("type", "itv"), ("action", action)])
                .await?
                .records()),
        }
    }

    /// Raw channel records, deduplicated by native id.
    ///
    /// Bulk actions are tried first; when none returns anything the genres are
    /// fetched concurrently (`concurrency` at a time) and merged.
    pub async fn list_all_channels(
        &self,
        genres: &GenreMap,
        concurrency: usize,
    ) -> Result<Vec<Value>, PortalError> {
        let bulk = first_success(LISTING_ACTIONS.to_vec(), |action| {
            async move {
                Attempt::from(
                    self.fetch_listing(action)
                        .await
                        .map(|records| (!records.is_empty()).then_some(records)),
                )
            }
            .boxed()
        })
        .await;

        if let Some((action, records)) = bulk {
            info!(action, count = records.len(), "portal bulk listing succeeded");
            return Ok(dedupe(records));
        }

        if genres.is_empty() {
            return Err(PortalError::Exhausted(
                "no listing action returned channels and no genres are known".to_string(),
            ));
        }

        let mut genre_ids: Vec<String> = genres.keys().cloned().collect();
        genre_ids.sort();
        info!(genres = genre_ids.len(), concurrency, "falling back to per-genre listing");

        let batches: Vec<Vec<Value>> = stream::iter(genre_ids)
            .map(|genre| {
                async move {
                    match self.fetch_genre_pages(&genre).await {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(genre = %genre, error = %e, "genre listing failed");
                            Vec::new()
                        }
                    }
                }
                .boxed()
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let merged = dedupe(batches.into_iter().flatten());
        if merged.is_empty() {
            return Err(PortalError::Exhausted(
                "every listing strategy returned no channels".to_string(),
            ));
        }
        Ok(merged)
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// Playable URL for a channel command: the portal's `create_link` answer,
    /// then a URL embedded in the command itself, then the synthesized
    /// `play/live.php` convention.
    pub async fn create_link(&self, cmd: &str, stream_id: &str) -> PlaybackLink {
        let params = [
            ("type", "itv"),
            ("action", "create_link"),
            ("cmd", cmd),
            ("series", ""),
            ("forced_storage", "undefined"),
            ("disable_ad", "0"),
            ("download", "0"),
        ];

        match self.request(&params).await {
            Ok(decoded) => {
                if let Some(url) = decoded
                    .find_str("cmd")
                    .or_else(|| decoded.find_str("url"))
                    .and_then(|c| extract_stream_url(&c))
                {
                    return PlaybackLink {
                        url,
                        source: LinkSource::Portal,
                    };
                }
                debug!(stream_id, "create_link answered without a usable URL");
            }
            Err(e) => warn!(stream_id, error = %e, "create_link failed"),
        }

        if let Some(url) = extract_stream_url(cmd).filter(|u| !is_placeholder(u)) {
            return PlaybackLink {
                url,
                source: LinkSource::Command,
            };
        }

        PlaybackLink {
            url: self.synthesized_url(stream_id),
            source: LinkSource::Synthesized,
        }
    }

    fn synthesized_url(&self, stream_id: &str) -> String {
        format!(
            "{}/play/live.php?mac={}&stream={}&extension=ts",
            self.base_url,
            urlencoding::encode(&self.mac),
            urlencoding::encode(stream_id)
        )
    }

    /// Tell the portal the device stopped watching. Best effort.
    pub async fn release_stream(&self, cmd: &str) -> bool {
        let params = [
            ("type", "stb"),
            ("action", "log"),
            ("real_action", "stop"),
            ("param", cmd),
            ("content_id", ""),
            ("tmp_type", "1"),
        ];

        match self.request(&params).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "stream release not acknowledged");
                false
            }
        }
    }
}
