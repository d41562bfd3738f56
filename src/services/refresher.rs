//! Background refresher
//!
//! Re-syncs every portal playlist on a fixed interval so their playback
//! secrets and tokens stay fresh in the store. Runs once the first interval
//! has elapsed, then periodically, until the shutdown token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::models::SourceKind;
use crate::services::progress::SyncTracker;
use crate::services::sync::SyncEngine;

/// Result of one refresh pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshResult {
    pub refreshed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl RefreshResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Refresh every portal playlist once, sequentially
pub async fn run_refresh(engine: &SyncEngine, tracker: &Arc<SyncTracker>) -> RefreshResult {
    let mut result = RefreshResult::default();

    let playlists = match engine.store().list_playlists(Some(SourceKind::Portal)).await {
        Ok(playlists) => playlists,
        Err(e) => {
            result.errors.push(format!("Listing playlists failed: {}", e));
            return result;
        }
    };

    for playlist in playlists {
        match tracker.run(engine, playlist.id).await {
            Some(Ok(outcome)) => {
                result.refreshed += 1;
                tracing::debug!(
                    "Refresh: playlist {} resynced ({} channels)",
                    playlist.id,
                    outcome.channel_count
                );
            }
            Some(Err(e)) => result
                .errors
                .push(format!("Playlist {} refresh failed: {}", playlist.id, e)),
            // a user-triggered sync is already running
            None => result.skipped += 1,
        }
    }

    result
}

/// Start the background refresh task
pub async fn start_refresh_task(
    engine: Arc<SyncEngine>,
    tracker: Arc<SyncTracker>,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    tracing::info!("Starting portal refresh task (interval: {}s)", interval_secs);

    let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Portal refresh task stopped");
                break;
            }
            _ = interval.tick() => {
                let result = run_refresh(&engine, &tracker).await;
                if result.refreshed > 0 {
                    tracing::info!("Refresh: {} portal playlists resynced", result.refreshed);
                }
                if !result.is_success() {
                    for error in &result.errors {
                        tracing::warn!("Refresh error: {}", error);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{ChannelStore, MemoryStore};
    use crate::models::PlaylistStatus;
    use crate::services::token_cache::SessionCaches;
    use crate::test_support::playlist;

    fn engine(store: Arc<MemoryStore>) -> Arc<SyncEngine> {
        let config = Config::default();
        let caches = Arc::new(SessionCaches::new(&config));
        Arc::new(SyncEngine::new(Arc::new(config), store, caches).unwrap())
    }

    #[tokio::test]
    async fn test_refresh_only_touches_portal_playlists() {
        let store = Arc::new(MemoryStore::new());
        // unreachable portal without a MAC fails fast
        let portal = playlist(SourceKind::Portal, "http://portal.invalid");
        let m3u = playlist(SourceKind::M3u, "http://m3u.invalid/list.m3u");
        let (portal_id, m3u_id) = (portal.id, m3u.id);
        store.insert_playlist(portal).await;
        store.insert_playlist(m3u).await;

        let tracker = Arc::new(SyncTracker::new(None));
        let result = run_refresh(&engine(store.clone()), &tracker).await;

        assert_eq!(result.refreshed, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            store.get_playlist(portal_id).await.unwrap().unwrap().status,
            PlaylistStatus::Error
        );
        assert_eq!(
            store.get_playlist(m3u_id).await.unwrap().unwrap().status,
            PlaylistStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_refresh_skips_running_sync() {
        let store = Arc::new(MemoryStore::new());
        let portal = playlist(SourceKind::Portal, "http://portal.invalid");
        let id = portal.id;
        store.insert_playlist(portal).await;

        let tracker = Arc::new(SyncTracker::new(None));
        assert!(tracker.try_start(id));

        let result = run_refresh(&engine(store), &tracker).await;
        assert_eq!(result.skipped, 1);
        assert!(result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_shutdown() {
        let tracker = Arc::new(SyncTracker::new(None));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(start_refresh_task(
            engine(Arc::new(MemoryStore::new())),
            tracker,
            600,
            shutdown.clone(),
        ));

        time::advance(Duration::from_secs(601)).await;
        shutdown.cancel();
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresh task should stop")
            .unwrap();
    }
}
