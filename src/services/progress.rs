//! Sync progress tracking
//!
//! Keeps the latest [`SyncProgress`] per playlist, fans every update out to
//! event-stream subscribers and, when a mirror is configured, copies the
//! snapshot there so polling still answers after a restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{SyncOutcome, SyncProgress, SyncStage};
use crate::services::redis::RedisService;
use crate::services::sync::{SyncEngine, SyncError};

const EVENT_CAPACITY: usize = 256;

/// Durable copy of the latest progress per playlist
#[async_trait]
pub trait ProgressMirror: Send + Sync {
    async fn store(&self, playlist_id: Uuid, progress: &SyncProgress) -> anyhow::Result<()>;
    async fn load(&self, playlist_id: Uuid) -> anyhow::Result<Option<SyncProgress>>;
    async fn clear(&self, playlist_id: Uuid) -> anyhow::Result<()>;
}

#[async_trait]
impl ProgressMirror for RedisService {
    async fn store(&self, playlist_id: Uuid, progress: &SyncProgress) -> anyhow::Result<()> {
        self.set_sync_progress(playlist_id, progress).await
    }

    async fn load(&self, playlist_id: Uuid) -> anyhow::Result<Option<SyncProgress>> {
        self.get_sync_progress(playlist_id).await
    }

    async fn clear(&self, playlist_id: Uuid) -> anyhow::Result<()> {
        self.clear_sync_progress(playlist_id).await
    }
}

enum MirrorOp {
    Store(Uuid, SyncProgress),
    Clear(Uuid),
}

struct Mirror {
    reader: Arc<dyn ProgressMirror>,
    writes: mpsc::UnboundedSender<MirrorOp>,
}

/// Apply mirror writes one at a time, in publish order
async fn write_mirror(mirror: Arc<dyn ProgressMirror>, mut ops: mpsc::UnboundedReceiver<MirrorOp>) {
    while let Some(op) = ops.recv().await {
        let (playlist_id, result) = match &op {
            MirrorOp::Store(id, progress) => (*id, mirror.store(*id, progress).await),
            MirrorOp::Clear(id) => (*id, mirror.clear(*id).await),
        };
        if let Err(e) = result {
            warn!(playlist = %playlist_id, "Failed to mirror sync progress: {:#}", e);
        }
    }
    debug!("progress mirror writer stopped");
}

pub struct SyncTracker {
    latest: Mutex<HashMap<Uuid, SyncProgress>>,
    events: broadcast::Sender<(Uuid, SyncProgress)>,
    mirror: Option<Mirror>,
}

impl SyncTracker {
    pub fn new(redis: Option<RedisService>) -> Self {
        Self::with_mirror(redis.map(|r| Arc::new(r) as Arc<dyn ProgressMirror>))
    }

    /// Spawns the mirror writer, so a mirror requires a running runtime
    pub fn with_mirror(mirror: Option<Arc<dyn ProgressMirror>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mirror = mirror.map(|reader| {
            let (writes, ops) = mpsc::unbounded_channel();
            tokio::spawn(write_mirror(reader.clone(), ops));
            Mirror { reader, writes }
        });
        Self {
            latest: Mutex::new(HashMap::new()),
            events,
            mirror,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SyncProgress>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mirror_write(&self, op: MirrorOp) {
        if let Some(mirror) = &self.mirror {
            if mirror.writes.send(op).is_err() {
                warn!("progress mirror writer is gone, update dropped");
            }
        }
    }

    /// Claim the playlist for a new sync. False while one is still running.
    pub fn try_start(&self, playlist_id: Uuid) -> bool {
        let mut latest = self.lock();
        if latest.get(&playlist_id).is_some_and(|p| !p.done) {
            return false;
        }
        latest.insert(
            playlist_id,
            SyncProgress::new(SyncStage::Starting, 0, "Queued"),
        );
        true
    }

    pub fn is_running(&self, playlist_id: Uuid) -> bool {
        self.lock().get(&playlist_id).is_some_and(|p| !p.done)
    }

    /// Record an update. Called from the sync engine's progress callback.
    pub fn publish(&self, playlist_id: Uuid, progress: SyncProgress) {
        self.lock().insert(playlist_id, progress.clone());
        // no subscribers is fine
        let _ = self.events.send((playlist_id, progress.clone()));
        self.mirror_write(MirrorOp::Store(playlist_id, progress));
    }

    /// Latest snapshot, from memory first, then the mirror
    pub async fn latest(&self, playlist_id: Uuid) -> Option<SyncProgress> {
        if let Some(progress) = self.lock().get(&playlist_id).cloned() {
            return Some(progress);
        }

        let mirror = self.mirror.as_ref()?;
        match mirror.reader.load(playlist_id).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(playlist = %playlist_id, "Failed to read mirrored sync progress: {:#}", e);
                None
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, SyncProgress)> {
        self.events.subscribe()
    }

    /// Run a sync with progress flowing into this tracker.
    /// Returns `None` when the playlist is already syncing.
    pub async fn run(
        self: &Arc<Self>,
        engine: &SyncEngine,
        playlist_id: Uuid,
    ) -> Option<Result<SyncOutcome, SyncError>> {
        if !self.try_start(playlist_id) {
            debug!(playlist = %playlist_id, "sync already running");
            return None;
        }
        Some(self.execute(engine, playlist_id).await)
    }

    /// Run a sync already claimed with [`SyncTracker::try_start`]
    pub async fn execute(
        self: &Arc<Self>,
        engine: &SyncEngine,
        playlist_id: Uuid,
    ) -> Result<SyncOutcome, SyncError> {
        self.mirror_write(MirrorOp::Clear(playlist_id));

        let tracker = Arc::clone(self);
        let report = move |progress: SyncProgress| tracker.publish(playlist_id, progress);
        let result = engine.sync_playlist(playlist_id, &report).await;

        // failures before the engine's first event leave the queued entry open
        if let Err(e) = &result {
            if self.is_running(playlist_id) {
                self.publish(playlist_id, SyncProgress::failed(&e.to_string()));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_start_blocks_concurrent_runs() {
        let tracker = SyncTracker::new(None);
        let id = Uuid::new_v4();

        assert!(tracker.try_start(id));
        assert!(!tracker.try_start(id));
        assert!(tracker.is_running(id));

        tracker.publish(id, SyncProgress::complete(3, 0.5));
        assert!(!tracker.is_running(id));
        assert!(tracker.try_start(id));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_latest() {
        let tracker = SyncTracker::new(None);
        let id = Uuid::new_v4();
        let mut events = tracker.subscribe();

        tracker.publish(id, SyncProgress::new(SyncStage::Fetching, 20, "Fetching"));

        let (got_id, progress) = events.recv().await.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(progress.stage, SyncStage::Fetching);
        assert_eq!(tracker.latest(id).await.unwrap().percent, 20);
        assert!(tracker.latest(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_run_unknown_playlist_reports_failure() {
        use crate::config::Config;
        use crate::db::MemoryStore;
        use crate::services::token_cache::SessionCaches;

        let config = Config::default();
        let caches = Arc::new(SessionCaches::new(&config));
        let engine = SyncEngine::new(Arc::new(config), Arc::new(MemoryStore::new()), caches).unwrap();
        let tracker = Arc::new(SyncTracker::new(None));
        let id = Uuid::new_v4();

        let result = tracker.run(&engine, id).await;
        assert!(matches!(result, Some(Err(SyncError::NotFound(_)))));

        let latest = tracker.latest(id).await.unwrap();
        assert!(latest.done);
        assert_eq!(latest.stage, SyncStage::Failed);
    }

    /// Records mirror writes; the first store is slow to land
    #[derive(Default)]
    struct SlowMirror {
        writes: Mutex<Vec<(u8, bool)>>,
    }

    #[async_trait]
    impl ProgressMirror for SlowMirror {
        async fn store(&self, _: Uuid, progress: &SyncProgress) -> anyhow::Result<()> {
            if progress.percent == 10 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.writes.lock().unwrap().push((progress.percent, progress.done));
            Ok(())
        }

        async fn load(&self, _: Uuid) -> anyhow::Result<Option<SyncProgress>> {
            Ok(None)
        }

        async fn clear(&self, _: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mirror_writes_keep_publish_order() {
        let mirror = Arc::new(SlowMirror::default());
        let tracker = SyncTracker::with_mirror(Some(mirror.clone() as Arc<dyn ProgressMirror>));
        let id = Uuid::new_v4();

        tracker.publish(id, SyncProgress::new(SyncStage::Fetching, 10, "Fetching"));
        tracker.publish(id, SyncProgress::new(SyncStage::Saving, 60, "Saving"));
        tracker.publish(id, SyncProgress::complete(2, 0.1));

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while mirror.writes.lock().unwrap().len() < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mirror writes should land");

        let writes = mirror.writes.lock().unwrap().clone();
        assert_eq!(writes[..2], [(10, false), (60, false)]);
        assert!(writes[2].1, "terminal snapshot must be written last");
    }
}
