//! Bulk channel synchronization
//!
//! Pulls every channel of a playlist from its upstream, normalizes the
//! records and writes them to the store in fixed-size unordered batches.
//! Channels missing from the latest pull are deleted once all batches are in.
//! A failed sync keeps whatever batches were already committed and marks the
//! playlist `error`.

use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{ChannelStore, StoreError};
use crate::models::{
    Channel, Playlist, PlaylistStatus, SourceKind, SyncOutcome, SyncProgress, SyncStage,
};
use crate::services::m3u_parser::{self, M3uError};
use crate::services::metrics::{CHANNELS_SYNCED, SYNC_RUNS};
use crate::services::normalizer::{apply_settings, normalize_m3u, normalize_portal, normalize_xtream};
use crate::services::portal::client::DEFAULT_PATH;
use crate::services::portal::{GenreMap, PortalClient, PortalError};
use crate::services::token_cache::{channel_key, ChannelToken, PortalSession, SessionCaches};
use crate::services::xtream::{XtreamClient, XtreamCredentials, XtreamError};

/// Progress callback handed to [`SyncEngine::sync_playlist`]
pub type ProgressFn = dyn Fn(SyncProgress) + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("playlist {0} not found")]
    NotFound(Uuid),
    #[error("playlist is missing {0}")]
    Incomplete(&'static str),
    #[error("portal: {0}")]
    Portal(#[from] PortalError),
    #[error("xtream: {0}")]
    Xtream(#[from] XtreamError),
    #[error("m3u: {0}")]
    M3u(#[from] M3uError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Buffers normalized channels and flushes them in fixed-size batches.
/// The first occurrence of a channel id wins.
struct BatchWriter<'a> {
    store: &'a dyn ChannelStore,
    playlist: &'a Playlist,
    batch_size: usize,
    pending: Vec<Channel>,
    seen: HashSet<String>,
    written: usize,
    skipped: usize,
}

impl<'a> BatchWriter<'a> {
    fn new(store: &'a dyn ChannelStore, playlist: &'a Playlist, batch_size: usize) -> Self {
        Self {
            store,
            playlist,
            batch_size: batch_size.max(1),
            pending: Vec::with_capacity(batch_size.max(1)),
            seen: HashSet::new(),
            written: 0,
            skipped: 0,
        }
    }

    /// Queue a channel; returns true when the push flushed a batch
    async fn push(&mut self, channel: Channel) -> Result<bool, StoreError> {
        if !self.seen.insert(channel.channel_id.clone()) {
            self.skipped += 1;
            return Ok(false);
        }

        let settings = self.playlist.settings_for(&channel.channel_id);
        self.pending.push(apply_settings(channel, &settings));

        if self.pending.len() >= self.batch_size {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.store.upsert_channels(self.playlist.id, &batch).await?;
        self.written += batch.len();
        debug!(playlist = %self.playlist.id, batch = batch.len(), written = self.written, "batch committed");
        Ok(())
    }

    /// Flush the remainder and delete channels absent from this sync
    async fn finish(mut self) -> Result<usize, StoreError> {
        self.flush().await?;

        let keep: Vec<String> = self.seen.into_iter().collect();
        let deleted = self
            .store
            .delete_channels_except(self.playlist.id, &keep)
            .await?;
        if self.skipped > 0 {
            warn!(playlist = %self.playlist.id, skipped = self.skipped, "duplicate channel ids skipped");
        }
        if deleted > 0 {
            info!(playlist = %self.playlist.id, deleted, "removed channels absent from upstream");
        }
        Ok(self.written)
    }
}

pub struct SyncEngine {
    config: Arc<Config>,
    store: Arc<dyn ChannelStore>,
    caches: Arc<SessionCaches>,
    http: Client,
    batch_size: usize,
}

impl SyncEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ChannelStore>,
        caches: Arc<SessionCaches>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .gzip(true)
            .build()?;
        let batch_size = config.sync_batch_size;

        Ok(Self {
            config,
            store,
            caches,
            http,
            batch_size,
        })
    }

    #[cfg(test)]
    fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    /// Run a full sync of one playlist.
    ///
    /// Status moves to `syncing`, then `active` with the new channel count,
    /// or `error` with the failure message.
    pub async fn sync_playlist(&self, id: Uuid, progress: &ProgressFn) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();
        let playlist = self
            .store
            .get_playlist(id)
            .await?
            .ok_or(SyncError::NotFound(id))?;
        let kind = playlist.source_kind;

        progress(SyncProgress::new(
            SyncStage::Starting,
            0,
            format!("Starting {} sync for {}", kind, playlist.name),
        ));
        info!(playlist = %id, kind = %kind, "sync started");

        match self.run(&playlist, progress).await {
            Ok(channel_count) => {
                let elapsed_seconds = started.elapsed().as_secs_f64();
                SYNC_RUNS.with_label_values(&[kind.as_str(), "success"]).inc();
                CHANNELS_SYNCED.inc_by(channel_count as u64);
                progress(SyncProgress::complete(channel_count, elapsed_seconds));
                info!(
                    playlist = %id,
                    kind = %kind,
                    channels = channel_count,
                    elapsed_secs = format!("{:.2}", elapsed_seconds),
                    "sync complete"
                );
                Ok(SyncOutcome {
                    channel_count,
                    elapsed_seconds,
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self
                    .store
                    .set_status(id, PlaylistStatus::Error, Some(&message))
                    .await
                {
                    warn!(playlist = %id, error = %store_err, "could not record sync failure");
                }
                SYNC_RUNS.with_label_values(&[kind.as_str(), "failure"]).inc();
                progress(SyncProgress::failed(&message));
                error!(playlist = %id, kind = %kind, error = %message, "sync failed");
                Err(e)
            }
        }
    }

    async fn run(&self, playlist: &Playlist, progress: &ProgressFn) -> Result<usize, SyncError> {
        self.store
            .set_status(playlist.id, PlaylistStatus::Syncing, None)
            .await?;

        let count = match playlist.source_kind {
            SourceKind::Portal => self.sync_portal(playlist, progress).await?,
            SourceKind::Xtream => self.sync_xtream(playlist, progress).await?,
            SourceKind::M3u => self.sync_m3u(playlist, progress).await?,
        };

        self.store
            .record_sync(playlist.id, count as i32, Utc::now())
            .await?;
        Ok(count)
    }

    /// Persist an already materialized channel list
    async fn persist(
        &self,
        playlist: &Playlist,
        channels: Vec<Channel>,
        progress: &ProgressFn,
    ) -> Result<usize, SyncError> {
        let total = channels.len().max(1);
        let mut writer = BatchWriter::new(self.store.as_ref(), playlist, self.batch_size);

        for channel in channels {
            if writer.push(channel).await? {
                let percent = 40 + (55 * writer.written / total) as u8;
                progress(
                    SyncProgress::new(SyncStage::Saving, percent, format!("Saved {} channels", writer.written))
                        .with_count(writer.written),
                );
            }
        }

        progress(SyncProgress::new(SyncStage::Cleanup, 95, "Removing stale channels"));
        Ok(writer.finish().await?)
    }

    async fn sync_portal(&self, playlist: &Playlist, progress: &ProgressFn) -> Result<usize, SyncError> {
        let mac = playlist
            .mac
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or(SyncError::Incomplete("device MAC"))?
            .trim()
            .to_uppercase();

        progress(SyncProgress::new(SyncStage::Authenticating, 5, "Handshaking with portal"));
        let mut client = PortalClient::new(
            self.http.clone(),
            &playlist.base_url,
            &mac,
            &self.config.portal_user_agent,
            self.config.portal_timeout(),
        )
        .with_session(playlist.api_path.clone(), None);

        let token = client.handshake().await;
        let profile = client.get_profile().await;
        if profile.offline {
            warn!(playlist = %playlist.id, "portal profile unavailable, continuing without secret");
        }
        let account = client.get_account_info().await;
        if let Some(expires) = account.expires.as_deref() {
            info!(playlist = %playlist.id, expires, plan = account.tariff_plan.as_deref().unwrap_or("-"), "portal account");
        }

        let session = PortalSession {
            api_path: client.api_path().unwrap_or(DEFAULT_PATH).to_string(),
            token: token.token().map(str::to_string),
            secret: profile.secret.or_else(|| playlist.portal_secret.clone()),
        };
        self.store
            .update_portal_session(
                playlist.id,
                &session.api_path,
                session.token.as_deref(),
                session.secret.as_deref(),
            )
            .await?;
        self.caches.sessions.insert(mac.clone(), session);

        progress(SyncProgress::new(SyncStage::Fetching, 15, "Fetching genres"));
        let genres = client.get_genres().await;

        progress(SyncProgress::new(
            SyncStage::Fetching,
            25,
            format!("Listing channels ({} genres)", genres.len()),
        ));
        let records = client
            .list_all_channels(&genres, self.config.genre_fetch_concurrency)
            .await?;
        let channels = normalize_portal(&records, &genres);

        for channel in &channels {
            if let (Some(secret), Some(url)) = (&channel.secret, &channel.sample_url) {
                self.caches.tokens.insert(
                    channel_key(&mac, &channel.channel_id),
                    ChannelToken {
                        secret: Some(secret.clone()),
                        url: url.clone(),
                    },
                );
            }
        }

        progress(
            SyncProgress::new(SyncStage::Saving, 40, format!("Saving {} channels", channels.len()))
                .with_count(channels.len()),
        );
        self.persist(playlist, channels, progress).await
    }

    async fn sync_xtream(&self, playlist: &Playlist, progress: &ProgressFn) -> Result<usize, SyncError> {
        let creds = XtreamCredentials::from_playlist(playlist)
            .ok_or(SyncError::Incomplete("Xtream username and password"))?;
        let client = XtreamClient::new(
            self.http.clone(),
            &creds,
            &self.config.user_agent,
            Duration::from_millis(self.config.xtream_timeout_ms),
        );

        progress(SyncProgress::new(
            SyncStage::Authenticating,
            5,
            "Authenticating and fetching live streams",
        ));
        let (auth, streams, categories) = tokio::try_join!(
            client.get_auth(),
            client.get_live_streams(),
            client.get_live_categories()
        )?;
        debug!(
            playlist = %playlist.id,
            user = auth.user_info.username.as_deref().unwrap_or("-"),
            streams = streams.len(),
            categories = categories.len(),
            "xtream listing fetched"
        );

        let categories: GenreMap = categories
            .into_iter()
            .map(|c| (c.category_id, c.category_name))
            .collect();
        let channels = normalize_xtream(&streams, &categories, &creds);

        progress(
            SyncProgress::new(SyncStage::Saving, 40, format!("Saving {} channels", channels.len()))
                .with_count(channels.len()),
        );
        self.persist(playlist, channels, progress).await
    }

    /// Streams the playlist: entries are normalized and batched as they parse
    async fn sync_m3u(&self, playlist: &Playlist, progress: &ProgressFn) -> Result<usize, SyncError> {
        progress(SyncProgress::new(SyncStage::Fetching, 5, "Downloading playlist"));
        let reader = m3u_parser::fetch(
            &self.http,
            &playlist.base_url,
            &self.config.user_agent,
            Duration::from_millis(self.config.m3u_fetch_timeout_ms),
        )
        .await?;

        let entries = m3u_parser::entries(reader);
        futures::pin_mut!(entries);
        let mut writer = BatchWriter::new(self.store.as_ref(), playlist, self.batch_size);

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if writer.push(normalize_m3u(&entry)).await? {
                // total unknown while streaming
                let percent = (10 + writer.written / 1000).min(90) as u8;
                progress(
                    SyncProgress::new(SyncStage::Saving, percent, format!("Saved {} channels", writer.written))
                        .with_count(writer.written),
                );
            }
        }

        progress(SyncProgress::new(SyncStage::Cleanup, 95, "Removing stale channels"));
        Ok(writer.finish().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ChannelSettings;
    use crate::test_support::{playlist, spawn_server};
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn m3u_body(ids: &[&str]) -> String {
        let mut body = String::from("#EXTM3U\n");
        for id in ids {
            body.push_str(&format!(
                "#EXTINF:-1 tvg-id=\"{id}\" group-title=\"News\",Channel {id}\nhttp://cdn.example/{id}.ts\n"
            ));
        }
        body
    }

    async fn m3u_server(body: String) -> String {
        let router = Router::new()
            .route("/list.m3u", get(move || async move { body }))
            .route("/broken.m3u", get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }));
        spawn_server(router).await
    }

    fn engine(store: Arc<MemoryStore>) -> SyncEngine {
        let config = Config::default();
        let caches = Arc::new(SessionCaches::new(&config));
        SyncEngine::new(Arc::new(config), store, caches).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<SyncProgress>>>, impl Fn(SyncProgress) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |p: SyncProgress| sink.lock().unwrap().push(p))
    }

    fn stale_channel(id: &str) -> Channel {
        Channel {
            channel_id: id.to_string(),
            native_id: Some(id.to_string()),
            name: "Gone".to_string(),
            logo: None,
            group: "Old".to_string(),
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

    #[tokio::test]
    async fn test_m3u_sync_writes_exactly_n_and_deletes_absent() {
        let base = m3u_server(m3u_body(&["1", "2", "3", "2", "4", "5"])).await;
        let store = Arc::new(MemoryStore::new());
        let mut p = playlist(SourceKind::M3u, &format!("{}/list.m3u", base));
        p.settings.insert(
            "3".to_string(),
            ChannelSettings {
                visible: false,
                ..ChannelSettings::default()
            },
        );
        let id = p.id;
        store.insert_playlist(p).await;
        store.upsert_channels(id, &[stale_channel("old")]).await.unwrap();

        let engine = engine(store.clone()).with_batch_size(2);
        let (events, sink) = recorder();
        let outcome = engine.sync_playlist(id, &sink).await.unwrap();

        assert_eq!(outcome.channel_count, 5);
        // one seeding write, then batches of 2, 2 and 1
        assert_eq!(store.upsert_calls(), 4);
        let channels = store.list_channels(id).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.channel_id.as_str()).collect();
        assert_eq!(channels.len(), 5);
        assert!(!ids.contains(&"old"));
        assert!(!channels.iter().find(|c| c.channel_id == "3").unwrap().visible);

        let stored = store.get_playlist(id).await.unwrap().unwrap();
        assert_eq!(stored.status, PlaylistStatus::Active);
        assert_eq!(stored.channel_count, 5);

        let events = events.lock().unwrap();
        assert_eq!(events.first().unwrap().stage, SyncStage::Starting);
        let last = events.last().unwrap();
        assert!(last.done);
        assert_eq!(last.stage, SyncStage::Complete);
        assert_eq!(last.channel_count, 5);
    }

    #[tokio::test]
    async fn test_failed_batch_marks_error_and_keeps_committed() {
        let base = m3u_server(m3u_body(&["1", "2", "3", "4", "5"])).await;
        let store = Arc::new(MemoryStore::failing_after(1));
        let p = playlist(SourceKind::M3u, &format!("{}/list.m3u", base));
        let id = p.id;
        store.insert_playlist(p).await;

        let engine = engine(store.clone()).with_batch_size(2);
        let (events, sink) = recorder();
        let result = engine.sync_playlist(id, &sink).await;

        assert!(matches!(result, Err(SyncError::Store(_))));
        assert_eq!(store.list_channels(id).await.unwrap().len(), 2);

        let stored = store.get_playlist(id).await.unwrap().unwrap();
        assert_eq!(stored.status, PlaylistStatus::Error);
        assert!(stored.last_error.unwrap().contains("write rejected"));

        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.stage, SyncStage::Failed);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn test_upstream_failure_marks_error() {
        let base = m3u_server(String::new()).await;
        let store = Arc::new(MemoryStore::new());
        let p = playlist(SourceKind::M3u, &format!("{}/broken.m3u", base));
        let id = p.id;
        store.insert_playlist(p).await;

        let result = engine(store.clone()).sync_playlist(id, &|_| {}).await;
        assert!(matches!(result, Err(SyncError::M3u(M3uError::Http(500)))));
        assert_eq!(
            store.get_playlist(id).await.unwrap().unwrap().status,
            PlaylistStatus::Error
        );
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_sync_future_is_send() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let report = |_: SyncProgress| {};
        let sync = engine.sync_playlist(Uuid::new_v4(), &report);
        assert_send(&sync);
    }

    #[tokio::test]
    async fn test_unknown_playlist() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4();
        assert!(matches!(
            engine.sync_playlist(id, &|_| {}).await,
            Err(SyncError::NotFound(missing)) if missing == id
        ));
    }

    async fn player_api(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        Json(match params.get("action").map(String::as_str) {
            None => json!({"user_info": {"username": "u", "status": "Active", "auth": 1}}),
            Some("get_live_categories") => json!([{"category_id": 1, "category_name": "Sports"}]),
            Some("get_live_streams") => json!([
                {"num": 1, "name": "Sport 1", "stream_id": 11, "category_id": "1"},
                {"num": 2, "name": "Sport 2", "stream_id": 12, "category_id": "1"},
                {"num": 3, "name": "Misc", "stream_id": 13}
            ]),
            _ => json!([]),
        })
    }

    #[tokio::test]
    async fn test_xtream_sync() {
        let base = spawn_server(Router::new().route("/player_api.php", get(player_api))).await;
        let store = Arc::new(MemoryStore::new());
        let mut p = playlist(SourceKind::Xtream, &base);
        p.username = Some("u".to_string());
        p.password = Some("p".to_string());
        let id = p.id;
        store.insert_playlist(p).await;

        let outcome = engine(store.clone()).sync_playlist(id, &|_| {}).await.unwrap();
        assert_eq!(outcome.channel_count, 3);

        let channel = store.find_channel(id, "11").await.unwrap().unwrap();
        assert_eq!(channel.group, "Sports");
        assert_eq!(channel.cmd, Some(format!("{}/live/u/p/11.ts", base)));
        let misc = store.find_channel(id, "13").await.unwrap().unwrap();
        assert_eq!(misc.group, crate::services::normalizer::UNCATEGORIZED);
    }

    async fn portal(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        Json(match params.get("action").map(String::as_str) {
            Some("handshake") => json!({"js": {"token": "TK"}}),
            Some("get_profile") => json!({"js": {"id": 7, "password": "SEC"}}),
            Some("get_genres") => json!({"js": [{"id": "*", "title": "All"}, {"id": "1", "title": "News"}]}),
            Some("get_all_channels") => json!({"js": {"data": [
                {"id": "1", "name": "A", "tv_genre_id": "1", "cmd": "ffrt http://localhost/ch/1"},
                {"id": "2", "name": "B", "tv_genre_id": "1", "cmd": "ffrt http://localhost/ch/2"},
                {"id": "2", "name": "B again", "tv_genre_id": "1", "cmd": "ffrt http://localhost/ch/2"}
            ]}}),
            _ => json!({"js": []}),
        })
    }

    #[tokio::test]
    async fn test_portal_sync_writes_back_session() {
        let base = spawn_server(Router::new().route("/portal.php", get(portal))).await;
        let store = Arc::new(MemoryStore::new());
        let mut p = playlist(SourceKind::Portal, &base);
        p.mac = Some("00:1a:79:00:00:02".to_string());
        let id = p.id;
        store.insert_playlist(p).await;

        let config = Config::default();
        let caches = Arc::new(SessionCaches::new(&config));
        let engine = SyncEngine::new(Arc::new(config), store.clone(), caches.clone()).unwrap();
        let outcome = engine.sync_playlist(id, &|_| {}).await.unwrap();
        assert_eq!(outcome.channel_count, 2);

        let stored = store.get_playlist(id).await.unwrap().unwrap();
        assert_eq!(stored.api_path.as_deref(), Some("/portal.php"));
        assert_eq!(stored.portal_token.as_deref(), Some("TK"));
        assert_eq!(stored.portal_secret.as_deref(), Some("SEC"));

        let session = caches.sessions.get(&"00:1A:79:00:00:02".to_string()).unwrap();
        assert_eq!(session.secret.as_deref(), Some("SEC"));

        let channel = store.find_channel(id, "1").await.unwrap().unwrap();
        assert_eq!(channel.group, "News");
        assert_eq!(channel.cmd.as_deref(), Some("ffrt http://localhost/ch/1"));
    }

    #[tokio::test]
    async fn test_portal_without_mac_is_incomplete() {
        let store = Arc::new(MemoryStore::new());
        let p = playlist(SourceKind::Portal, "http://portal.invalid");
        let id = p.id;
        store.insert_playlist(p).await;

        let result = engine(store).sync_playlist(id, &|_| {}).await;
        assert!(matches!(result, Err(SyncError::Incomplete(_))));
    }
}
