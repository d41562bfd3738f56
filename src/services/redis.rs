use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::models::SyncProgress;

/// How long a sync progress snapshot survives in Redis
pub const PROGRESS_TTL_SECS: u64 = 3600;

fn progress_key(playlist_id: Uuid) -> String {
    format!("sync:progress:{}", playlist_id)
}

/// Redis mirror for sync progress, so status polling survives restarts
#[derive(Clone)]
pub struct RedisService {
    conn: ConnectionManager,
}

impl RedisService {
    /// Create a new Redis service with connection pooling
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { conn })
    }

    /// Set a key with expiration (seconds)
    pub async fn set_ex<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(value)?;
        let _: () = conn.set_ex(key, serialized, ttl_seconds).await?;
        Ok(())
    }

    /// Get a key and deserialize
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(v) => {
                let parsed = serde_json::from_str(&v)?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Delete a key
    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Ping Redis to check connection
    pub async fn ping(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }

    // ============ Sync Progress ============

    pub async fn set_sync_progress(&self, playlist_id: Uuid, progress: &SyncProgress) -> Result<()> {
        self.set_ex(&progress_key(playlist_id), progress, PROGRESS_TTL_SECS)
            .await
    }

    pub async fn get_sync_progress(&self, playlist_id: Uuid) -> Result<Option<SyncProgress>> {
        self.get(&progress_key(playlist_id)).await
    }

    pub async fn clear_sync_progress(&self, playlist_id: Uuid) -> Result<()> {
        self.del(&progress_key(playlist_id)).await
    }
}
