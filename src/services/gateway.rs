//! Stream proxy gateway
//!
//! Per `(device, channel)`: resolve the upstream URL, refuse a duplicate
//! request for the same URL inside the guard window, terminate the previous
//! connection and let the upstream settle, then pipe the upstream body
//! through a cancellable stream.

use async_stream::stream;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{FutureExt, Stream, StreamExt};
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{ChannelStore, StoreError};
use crate::models::{Channel, Playlist, SourceKind};
use crate::services::connections::{
    connection_key, ConnectionKey, ConnectionLease, ConnectionRegistry, ReleaseTarget,
};
use crate::services::fallback::{first_success, Attempt};
use crate::services::metrics::{STREAMS_REJECTED, STREAMS_STARTED};
use crate::services::portal::client::{normalize_base_url, DEFAULT_PATH, X_USER_AGENT};
use crate::services::portal::{LinkSource, PortalClient};
use crate::services::token_cache::{channel_key, ChannelToken, PortalSession, SessionCaches};
use crate::services::xtream::{extract_credentials, stream_id_of, XtreamCredentials};

// Re-export reqwest header module to avoid version conflicts
mod reqwest_header {
    pub use reqwest::header::{
        ACCEPT, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
    };
}

/// Viewer request for one channel
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub device_id: String,
    pub channel_id: String,
    pub kind: Option<SourceKind>,
    pub playlist_id: Option<Uuid>,
    /// Literal upstream URL for sources that carry one
    pub url: Option<String>,
    pub range: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    NotFound(String),
    #[error("already connecting")]
    Duplicate,
    #[error("{0}")]
    BadRequest(String),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Duplicate => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(e) => {
                tracing::error!("Store error while resolving stream: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Upstream chosen for a request
#[derive(Debug, Clone)]
struct Resolved {
    url: String,
    kind: SourceKind,
    release: Option<ReleaseTarget>,
    /// URL cache entry to drop when the upstream refuses
    cache_key: Option<String>,
}

/// Ordered portal URL strategies
#[derive(Debug, Clone, Copy)]
enum PortalStrategy {
    CachedUrl,
    CreateLink,
    SecretUrl,
}

impl fmt::Display for PortalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortalStrategy::CachedUrl => "cached-url",
            PortalStrategy::CreateLink => "create-link",
            PortalStrategy::SecretUrl => "secret-url",
        })
    }
}

struct PortalContext<'a> {
    playlist: &'a Playlist,
    channel: &'a Channel,
    mac: String,
    key: String,
    stream_id: String,
}

/// Guess content type from URL
fn guess_content_type(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if lower.contains(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if lower.contains(".mp4") {
        "video/mp4"
    } else if lower.contains(".mkv") {
        "video/x-matroska"
    } else {
        "video/MP2T"
    }
}

/// Validate URL is HTTP/HTTPS
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// The `/live/...` form of a portal stream URL, tried once after a 404
pub fn alternate_live_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let origin = parsed.origin().ascii_serialization();
    let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

    if let Some(stream_id) = params.get("stream") {
        let mac = params.get("mac").map(String::as_str).unwrap_or_default();
        let token = params
            .get("play_token")
            .or_else(|| params.get("token"))
            .map(String::as_str)
            .unwrap_or(mac);
        let extension = params.get("extension").map(String::as_str).unwrap_or("ts");
        return Some(format!(
            "{}/live/{}/{}/{}.{}",
            origin,
            urlencoding::encode(mac),
            urlencoding::encode(token),
            stream_id,
            extension
        ));
    }

    if parsed.path().starts_with("/live/") {
        return None;
    }
    let mut alternate = format!("{}/live{}", origin, parsed.path());
    if let Some(query) = parsed.query() {
        alternate.push('?');
        alternate.push_str(query);
    }
    Some(alternate)
}

/// Forward upstream chunks until the upstream ends or `lease` is cancelled.
/// The lease lives inside the stream, so dropping the response (client
/// disconnect) or finishing it releases the registry entry.
pub fn pipe_upstream<S, B, E>(upstream: S, lease: ConnectionLease) -> impl Stream<Item = Result<B, E>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    E: fmt::Display,
{
    let cancel = lease.cancel_token();
    stream! {
        let _lease = lease;
        futures::pin_mut!(upstream);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled, closing upstream");
                    None
                }
                chunk = upstream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => yield Ok(bytes),
                Some(Err(e)) => {
                    warn!("Upstream read failed: {}", e);
                    yield Err(e);
                    break;
                }
                None => break,
            }
        }
    }
}

pub struct Gateway {
    config: Arc<Config>,
    store: Arc<dyn ChannelStore>,
    caches: Arc<SessionCaches>,
    registry: Arc<ConnectionRegistry>,
    /// Upstream media client (connect timeout only)
    stream_http: Client,
    /// Portal API client (per-request timeouts)
    api_http: Client,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ChannelStore>,
        caches: Arc<SessionCaches>,
    ) -> Result<Self, reqwest::Error> {
        let stream_http = Client::builder()
            .connect_timeout(config.upstream_connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(true)
            .build()?;
        let api_http = Client::builder().danger_accept_invalid_certs(true).build()?;
        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_millis(config.url_guard_ms),
            Duration::from_secs(config.max_connection_age_secs),
        ));

        Ok(Self {
            config,
            store,
            caches,
            registry,
            stream_http,
            api_http,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn portal_client(&self, playlist: &Playlist, mac: &str) -> PortalClient {
        PortalClient::new(
            self.api_http.clone(),
            &playlist.base_url,
            mac,
            &self.config.portal_user_agent,
            self.config.portal_timeout(),
        )
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    async fn lookup(&self, req: &StreamRequest) -> Result<Option<(Playlist, Channel)>, GatewayError> {
        if let Some(id) = req.playlist_id {
            let playlist = self
                .store
                .get_playlist(id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("Playlist {} not found", id)))?;
            let channel = self.store.find_channel(id, &req.channel_id).await?;
            return Ok(channel.map(|c| (playlist, c)));
        }

        if req.url.is_none() || req.kind == Some(SourceKind::Portal) {
            return Ok(self
                .store
                .find_channel_for_device(&req.device_id, &req.channel_id)
                .await?);
        }
        Ok(None)
    }

    async fn resolve(&self, req: &StreamRequest) -> Result<Resolved, GatewayError> {
        match self.lookup(req).await? {
            Some((playlist, channel)) => match playlist.source_kind {
                SourceKind::Portal => Ok(self.resolve_portal(&playlist, &channel, &req.device_id).await),
                SourceKind::Xtream => {
                    let stream_id = channel.native_id.as_deref().unwrap_or(&channel.channel_id);
                    let url = XtreamCredentials::from_playlist(&playlist)
                        .map(|creds| creds.live_url(stream_id))
                        .or_else(|| channel.cmd.clone())
                        .or_else(|| req.url.clone())
                        .ok_or_else(|| GatewayError::NotFound(format!("No stream URL for channel {}", channel.channel_id)))?;
                    Ok(Resolved { url, kind: SourceKind::Xtream, release: None, cache_key: None })
                }
                SourceKind::M3u => {
                    let url = channel
                        .cmd
                        .clone()
                        .or_else(|| req.url.clone())
                        .ok_or_else(|| GatewayError::NotFound(format!("No stream URL for channel {}", channel.channel_id)))?;
                    Ok(Resolved { url, kind: SourceKind::M3u, release: None, cache_key: None })
                }
            },
            None => {
                let url = req.url.clone().ok_or_else(|| {
                    GatewayError::NotFound(format!(
                        "Channel {} not found for device {}",
                        req.channel_id, req.device_id
                    ))
                })?;
                if !is_valid_http_url(&url) {
                    return Err(GatewayError::BadRequest("Invalid url parameter".to_string()));
                }

                let creds = extract_credentials(&url);
                let kind = req.kind.unwrap_or(if creds.is_some() {
                    SourceKind::Xtream
                } else {
                    SourceKind::M3u
                });
                let url = match (kind, creds, stream_id_of(&url)) {
                    (SourceKind::Xtream, Some(creds), Some(id)) if url.contains("/live/") => creds.live_url(&id),
                    _ => url,
                };
                Ok(Resolved { url, kind, release: None, cache_key: None })
            }
        }
    }

    /// Cached or bootstrapped portal session for a device
    async fn portal_session(&self, playlist: &Playlist, mac: &str) -> PortalSession {
        if let Some(session) = self.caches.sessions.get(&mac.to_string()) {
            return session;
        }

        let mut client = self
            .portal_client(playlist, mac)
            .with_session(playlist.api_path.clone(), None);
        let token = client.handshake().await;
        let profile = client.get_profile().await;

        let session = PortalSession {
            api_path: client.api_path().unwrap_or(DEFAULT_PATH).to_string(),
            token: token.token().map(str::to_string),
            secret: profile.secret.or_else(|| playlist.portal_secret.clone()),
        };
        self.caches.sessions.insert(mac.to_string(), session.clone());
        info!(mac, path = %session.api_path, "portal session bootstrapped");
        session
    }

    async fn attempt_portal(&self, strategy: PortalStrategy, ctx: &PortalContext<'_>) -> Attempt<String> {
        match strategy {
            PortalStrategy::CachedUrl => self
                .caches
                .urls
                .get(&ctx.key)
                .map_or(Attempt::Empty, Attempt::Success),
            PortalStrategy::CreateLink => {
                let Some(cmd) = ctx.channel.cmd.as_deref().filter(|c| !c.trim().is_empty()) else {
                    return Attempt::Empty;
                };
                let session = self.portal_session(ctx.playlist, &ctx.mac).await;
                let link = self
                    .portal_client(ctx.playlist, &ctx.mac)
                    .with_session(Some(session.api_path), session.token)
                    .create_link(cmd, &ctx.stream_id)
                    .await;
                match link.source {
                    LinkSource::Synthesized => Attempt::Empty,
                    LinkSource::Portal | LinkSource::Command => Attempt::Success(link.url),
                }
            }
            PortalStrategy::SecretUrl => {
                // bootstrap first so the profile secret is known
                self.portal_session(ctx.playlist, &ctx.mac).await;
                Attempt::Success(self.secret_url(ctx))
            }
        }
    }

    fn portal_secret(&self, ctx: &PortalContext<'_>) -> Option<String> {
        self.caches
            .tokens
            .get(&ctx.key)
            .and_then(|t| t.secret)
            .or_else(|| ctx.channel.secret.clone())
            .or_else(|| self.caches.sessions.get(&ctx.mac).and_then(|s| s.secret))
            .or_else(|| ctx.playlist.portal_secret.clone())
    }

    /// `{base}/play/live.php?mac=..&stream=..&extension=ts[&play_token=..]`
    fn secret_url(&self, ctx: &PortalContext<'_>) -> String {
        let mut url = format!(
            "{}/play/live.php?mac={}&stream={}&extension=ts",
            normalize_base_url(&ctx.playlist.base_url),
            urlencoding::encode(&ctx.mac),
            urlencoding::encode(&ctx.stream_id)
        );
        if let Some(secret) = self.portal_secret(ctx) {
            url.push_str("&play_token=");
            url.push_str(&urlencoding::encode(&secret));
        }
        url
    }

    async fn resolve_portal(&self, playlist: &Playlist, channel: &Channel, device_id: &str) -> Resolved {
        let mac = playlist
            .mac
            .as_deref()
            .unwrap_or(device_id)
            .trim()
            .to_uppercase();
        let ctx = PortalContext {
            playlist,
            channel,
            key: channel_key(&mac, &channel.channel_id),
            stream_id: channel
                .native_id
                .clone()
                .unwrap_or_else(|| channel.channel_id.clone()),
            mac,
        };

        let strategies = [
            PortalStrategy::CachedUrl,
            PortalStrategy::CreateLink,
            PortalStrategy::SecretUrl,
        ];
        let (strategy, url) = first_success(strategies, |s| self.attempt_portal(s, &ctx).boxed())
            .await
            .unwrap_or_else(|| (PortalStrategy::SecretUrl, self.secret_url(&ctx)));
        debug!(channel = %channel.channel_id, strategy = %strategy, "portal stream resolved");

        let secret = self.portal_secret(&ctx);
        self.caches.urls.insert(ctx.key.clone(), url.clone());
        self.caches.tokens.insert(
            ctx.key.clone(),
            ChannelToken {
                secret,
                url: url.clone(),
            },
        );

        let session = self.caches.sessions.get(&ctx.mac);
        let release = channel.cmd.clone().map(|cmd| ReleaseTarget {
            base_url: playlist.base_url.clone(),
            mac: ctx.mac.clone(),
            api_path: session
                .as_ref()
                .map(|s| s.api_path.clone())
                .or_else(|| playlist.api_path.clone()),
            token: session
                .and_then(|s| s.token)
                .or_else(|| playlist.portal_token.clone()),
            cmd,
        });

        Resolved {
            url,
            kind: SourceKind::Portal,
            release,
            cache_key: Some(ctx.key),
        }
    }

    // ========================================================================
    // Upstream
    // ========================================================================

    async fn send(
        &self,
        url: &str,
        kind: SourceKind,
        range: Option<&str>,
    ) -> Result<reqwest::Response, GatewayError> {
        let user_agent = match kind {
            SourceKind::Portal => self.config.portal_user_agent.as_str(),
            SourceKind::Xtream | SourceKind::M3u => self.config.user_agent.as_str(),
        };

        let mut request = self
            .stream_http
            .get(url)
            .header("User-Agent", user_agent)
            .header(reqwest_header::ACCEPT, "*/*");
        if kind == SourceKind::Portal {
            request = request.header("X-User-Agent", X_USER_AGENT);
        }
        if let Some(range) = range {
            request = request.header(reqwest_header::RANGE, range);
        }

        match tokio::time::timeout(self.config.upstream_connect_timeout(), request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(GatewayError::Upstream(e.to_string())),
            Err(_) => Err(GatewayError::Upstream("connect timed out".to_string())),
        }
    }

    /// Connect, retrying a portal source once on the `/live/...` form after a
    /// 404 or a failed connect
    async fn connect(
        &self,
        url: &str,
        kind: SourceKind,
        range: Option<&str>,
    ) -> Result<(reqwest::Response, String), GatewayError> {
        let first = self.send(url, kind, range).await;
        let alternate = match kind {
            SourceKind::Portal => alternate_live_url(url),
            SourceKind::Xtream | SourceKind::M3u => None,
        };

        let (response, final_url) = match (first, alternate) {
            (Ok(response), Some(alternate)) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                warn!(url, alternate = %alternate, "Portal upstream returned 404, retrying alternate");
                (self.send(&alternate, kind, range).await?, alternate)
            }
            (Err(e), Some(alternate)) => {
                warn!(url, alternate = %alternate, error = %e, "Portal upstream unreachable, retrying alternate");
                (self.send(&alternate, kind, range).await?, alternate)
            }
            (first, _) => (first?, url.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!("upstream answered {}", status.as_u16())));
        }
        Ok((response, final_url))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Serve one viewer request
    pub async fn open(&self, req: StreamRequest) -> Result<Response, GatewayError> {
        let key = connection_key(&req.device_id, &req.channel_id);
        let resolved = self.resolve(&req).await?;

        if !self.registry.try_guard(&resolved.url) {
            STREAMS_REJECTED.with_label_values(&["duplicate"]).inc();
            info!(device = %key.0, channel = %key.1, "Duplicate stream request within guard window");
            return Err(GatewayError::Duplicate);
        }

        self.terminate(&key);
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

        let (upstream, url) = match self.connect(&resolved.url, resolved.kind, req.range.as_deref()).await {
            Ok(connected) => connected,
            Err(e) => {
                STREAMS_REJECTED.with_label_values(&["upstream"]).inc();
                if let Some(cache_key) = &resolved.cache_key {
                    self.caches.urls.remove(cache_key);
                }
                warn!(device = %key.0, channel = %key.1, error = %e, "Upstream connect failed");
                return Err(e);
            }
        };

        let lease = self
            .registry
            .register(key, &url, resolved.kind, resolved.release);
        STREAMS_STARTED.inc();
        debug!(serial = lease.serial(), url = %url, "upstream connected");

        build_response(upstream, &url, lease)
    }

    /// Cancel the connection for a key and notify the portal. Returns false
    /// for unknown keys.
    fn terminate(&self, key: &ConnectionKey) -> bool {
        match self.registry.kill(key) {
            Some(connection) => {
                if let Some(target) = connection.release {
                    self.spawn_release(target);
                }
                true
            }
            None => false,
        }
    }

    pub fn kill(&self, device_id: &str, channel_id: &str) -> bool {
        self.terminate(&connection_key(device_id, channel_id))
    }

    /// Evict stale connections and expired cache entries
    pub fn reap(&self) -> usize {
        let evicted = self.registry.reap();
        let count = evicted.len();
        for (_, connection) in evicted {
            if let Some(target) = connection.release {
                self.spawn_release(target);
            }
        }
        let purged = self.caches.purge_expired();
        if count > 0 || purged > 0 {
            info!(evicted = count, purged, "Reaper pass");
        }
        count
    }

    /// End every active stream so a graceful shutdown is not held open
    pub fn close_all(&self) -> usize {
        let closed = self.registry.kill_all();
        let count = closed.len();
        for (_, connection) in closed {
            if let Some(target) = connection.release {
                self.spawn_release(target);
            }
        }
        if count > 0 {
            info!(closed = count, "Closed active streams");
        }
        count
    }

    fn spawn_release(&self, target: ReleaseTarget) {
        let http = self.api_http.clone();
        let user_agent = self.config.portal_user_agent.clone();
        let timeout = self.config.portal_timeout();
        tokio::spawn(async move {
            let client = PortalClient::new(http, &target.base_url, &target.mac, &user_agent, timeout)
                .with_session(target.api_path, target.token);
            client.release_stream(&target.cmd).await;
        });
    }
}

fn build_response(
    upstream: reqwest::Response,
    url: &str,
    lease: ConnectionLease,
) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let upstream_headers = upstream.headers();

    let content_type = upstream_headers
        .get(reqwest_header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| guess_content_type(url).to_string());

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Length, Content-Type, Content-Range, Accept-Ranges",
        );

    // Mirror framing headers (reqwest constants for reading, axum for writing)
    for (from, to) in [
        (reqwest_header::CONTENT_LENGTH, header::CONTENT_LENGTH),
        (reqwest_header::CONTENT_RANGE, header::CONTENT_RANGE),
        (reqwest_header::ACCEPT_RANGES, header::ACCEPT_RANGES),
    ] {
        if let Some(value) = upstream_headers.get(from).and_then(|v| v.to_str().ok()) {
            response = response.header(to, value);
        }
    }

    let body = Body::from_stream(pipe_upstream(upstream.bytes_stream(), lease));
    response.body(body).map_err(|e| {
        tracing::error!("Failed to build response: {}", e);
        GatewayError::Upstream(e.to_string())
    })
}

/// Periodically evict stale connections until `shutdown` fires
pub fn spawn_reaper(
    gateway: Arc<Gateway>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stream reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    gateway.reap();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::test_support::{playlist, spawn_server};
    use axum::body::Bytes;
    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const MAC: &str = "00:1A:79:00:00:01";

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn infinite(State(dropped): State<Arc<AtomicBool>>) -> Body {
        let flag = DropFlag(dropped);
        Body::from_stream(async_stream::stream! {
            let _flag = flag;
            loop {
                yield Ok::<_, std::io::Error>(vec![0x47u8; 188]);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    }

    async fn fixed(headers: HeaderMap) -> Response {
        match headers.get("range").and_then(|v| v.to_str().ok()) {
            Some("bytes=1-3") => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("content-range", "bytes 1-3/5")
                .body(Body::from("ell"))
                .unwrap(),
            _ => "hello".into_response(),
        }
    }

    async fn alternate(Path((mac, token, file)): Path<(String, String, String)>) -> String {
        format!("alt:{}:{}:{}", mac, token, file)
    }

    async fn portal(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        let host = headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or_default();
        Json(match params.get("action").map(String::as_str) {
            Some("handshake") => json!({"js": {"token": "T1"}}),
            Some("get_profile") => json!({"js": {"id": 1, "password": "SECRET"}}),
            Some("create_link") if params.get("cmd").map(String::as_str) == Some("ffrt http://localhost/ch/1") => {
                json!({"js": {"cmd": format!("ffmpeg http://{}/live/ok.ts", host)}})
            }
            _ => json!({"js": {}}),
        })
    }

    async fn upstream() -> (String, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let router = Router::new()
            .route("/infinite.ts", get(infinite))
            .route("/live/ok.ts", get(fixed))
            .route("/live/:mac/:token/:file", get(alternate))
            .route("/play/live.php", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/stalled/play/live.php",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            )
            .route("/portal.php", get(portal))
            .route("/stalled/portal.php", get(portal))
            .with_state(dropped.clone());
        (spawn_server(router).await, dropped)
    }

    fn gateway(store: Arc<dyn ChannelStore>) -> Gateway {
        gateway_with(store, Config::default())
    }

    fn gateway_with(store: Arc<dyn ChannelStore>, config: Config) -> Gateway {
        let caches = Arc::new(SessionCaches::new(&config));
        Gateway::new(Arc::new(config), store, caches).unwrap()
    }

    fn portal_channel(id: &str, cmd: &str) -> Channel {
        Channel {
            cmd: Some(cmd.to_string()),
            ..bare_portal_channel(id)
        }
    }

    fn bare_portal_channel(id: &str) -> Channel {
        Channel {
            channel_id: id.to_string(),
            native_id: Some(id.to_string()),
            name: format!("Channel {}", id),
            logo: None,
            group: "News".to_string(),
            number: None,
            cmd: None,
            secret: None,
            sample_url: None,
            visible: true,
            custom_name: None,
            custom_logo: None,
            custom_order: None,
        }
    }

    async fn portal_store(base: &str, channels: &[Channel]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut p = playlist(SourceKind::Portal, base);
        p.mac = Some(MAC.to_string());
        let id = p.id;
        store.insert_playlist(p).await;
        store.upsert_channels(id, channels).await.unwrap();
        store
    }

    fn direct(device: &str, channel: &str, url: String) -> StreamRequest {
        StreamRequest {
            device_id: device.to_string(),
            channel_id: channel.to_string(),
            kind: Some(SourceKind::M3u),
            url: Some(url),
            ..StreamRequest::default()
        }
    }

    async fn drain(body: &mut (impl Stream<Item = Result<Bytes, axum::Error>> + Unpin)) {
        while body.next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_force_kill_ends_stream_and_drops_upstream() {
        let (base, dropped) = upstream().await;
        let gateway = gateway(Arc::new(MemoryStore::new()));

        let response = gateway
            .open(direct("aa:bb:cc:dd:ee:ff", "1", format!("{}/infinite.ts", base)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        assert!(body.next().await.unwrap().is_ok());
        assert_eq!(gateway.registry().len(), 1);

        assert!(gateway.kill("AA:BB:CC:DD:EE:FF", "1"));
        tokio::time::timeout(Duration::from_secs(2), drain(&mut body))
            .await
            .expect("downstream should end after kill");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream body should be dropped");

        assert_eq!(gateway.registry().len(), 0);
        assert!(!gateway.kill("AA:BB:CC:DD:EE:FF", "1"));
    }

    #[tokio::test]
    async fn test_duplicate_url_rejected() {
        let (base, _dropped) = upstream().await;
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let url = format!("{}/infinite.ts", base);

        let _first = gateway.open(direct("dev", "1", url.clone())).await.unwrap();
        let second = gateway.open(direct("dev", "1", url)).await;

        assert!(matches!(second, Err(GatewayError::Duplicate)));
        assert_eq!(
            second.unwrap_err().into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(gateway.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_new_request_replaces_prior_connection() {
        let (base, _dropped) = upstream().await;
        let gateway = gateway(Arc::new(MemoryStore::new()));

        let first = gateway
            .open(direct("dev", "1", format!("{}/infinite.ts?a=1", base)))
            .await
            .unwrap();
        let mut first_body = first.into_body().into_data_stream();

        let _second = gateway
            .open(direct("dev", "1", format!("{}/infinite.ts?a=2", base)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), drain(&mut first_body))
            .await
            .expect("prior stream should be terminated");
        let active = gateway.registry().list();
        assert_eq!(active.len(), 1);
        assert!(active[0].url.ends_with("a=2"));
    }

    #[tokio::test]
    async fn test_range_passthrough() {
        let (base, _dropped) = upstream().await;
        let gateway = gateway(Arc::new(MemoryStore::new()));

        let mut req = direct("dev", "9", format!("{}/live/ok.ts", base));
        req.range = Some("bytes=1-3".to_string());
        let response = gateway.open(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-range"], "bytes 1-3/5");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ell");
    }

    #[tokio::test]
    async fn test_portal_create_link_resolution() {
        let (base, _dropped) = upstream().await;
        let store = portal_store(&base, &[portal_channel("1", "ffrt http://localhost/ch/1")]).await;
        let gateway = gateway(store);

        let response = gateway
            .open(StreamRequest {
                device_id: MAC.to_string(),
                channel_id: "1".to_string(),
                ..StreamRequest::default()
            })
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");

        let key = channel_key(MAC, "1");
        assert_eq!(
            gateway.caches.urls.get(&key),
            Some(format!("{}/live/ok.ts", base))
        );
        assert_eq!(
            gateway.caches.sessions.get(&MAC.to_string()).and_then(|s| s.secret),
            Some("SECRET".to_string())
        );
    }

    #[tokio::test]
    async fn test_portal_404_retries_alternate() {
        let (base, _dropped) = upstream().await;
        let store = portal_store(&base, &[portal_channel("5", "ffrt http://localhost/ch/5")]).await;
        let gateway = gateway(store);

        let response = gateway
            .open(StreamRequest {
                device_id: MAC.to_string(),
                channel_id: "5".to_string(),
                ..StreamRequest::default()
            })
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], format!("alt:{}:SECRET:5.ts", MAC).as_bytes());
    }

    #[tokio::test]
    async fn test_portal_without_command_bootstraps_secret() {
        let (base, _dropped) = upstream().await;
        let store = portal_store(&base, &[bare_portal_channel("5")]).await;
        let gateway = gateway(store);

        let response = gateway
            .open(StreamRequest {
                device_id: MAC.to_string(),
                channel_id: "5".to_string(),
                ..StreamRequest::default()
            })
            .await
            .unwrap();

        // the secret only comes from get_profile, so the handshake ran
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], format!("alt:{}:SECRET:5.ts", MAC).as_bytes());
        assert_eq!(
            gateway.caches.sessions.get(&MAC.to_string()).and_then(|s| s.token),
            Some("T1".to_string())
        );
    }

    #[tokio::test]
    async fn test_portal_connect_timeout_retries_alternate() {
        let (base, _dropped) = upstream().await;
        let store = portal_store(&format!("{}/stalled", base), &[bare_portal_channel("7")]).await;
        let config = Config {
            upstream_connect_timeout_ms: 300,
            ..Config::default()
        };
        let gateway = gateway_with(store, config);

        let response = gateway
            .open(StreamRequest {
                device_id: MAC.to_string(),
                channel_id: "7".to_string(),
                ..StreamRequest::default()
            })
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], format!("alt:{}:SECRET:7.ts", MAC).as_bytes());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_open_future_is_send() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let open = gateway.open(StreamRequest::default());
        assert_send(&open);
    }

    #[tokio::test]
    async fn test_unknown_channel_not_found() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let result = gateway
            .open(StreamRequest {
                device_id: MAC.to_string(),
                channel_id: "404".to_string(),
                ..StreamRequest::default()
            })
            .await;

        let response = result.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_alternate_live_url() {
        assert_eq!(
            alternate_live_url("http://p.example/play/live.php?mac=AA&stream=5&extension=ts&play_token=tk").as_deref(),
            Some("http://p.example/live/AA/tk/5.ts")
        );
        assert_eq!(
            alternate_live_url("http://cdn.example:81/ch/5?x=1").as_deref(),
            Some("http://cdn.example:81/live/ch/5?x=1")
        );
        assert_eq!(alternate_live_url("http://cdn.example/live/a/b/5.ts"), None);
    }
}
