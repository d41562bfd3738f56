//! Active stream registry
//!
//! At most one connection per `(device, channel)`. Each entry owns a
//! cancellation token shared with the piped response stream; cancelling it
//! ends the downstream body and drops the upstream one. The stream holds a
//! [`ConnectionLease`] whose drop removes the entry, but only while the entry
//! still belongs to that lease.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::SourceKind;
use crate::services::metrics::ACTIVE_STREAMS;

/// Query parameters that change on every link and must not defeat the guard
const VOLATILE_PARAMS: &[&str] = &["play_token", "token"];

/// `(device, channel)`
pub type ConnectionKey = (String, String);

pub fn connection_key(device_id: &str, channel_id: &str) -> ConnectionKey {
    (device_id.trim().to_uppercase(), channel_id.trim().to_string())
}

/// Where to send a stop notice when a portal stream is terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTarget {
    pub base_url: String,
    pub mac: String,
    pub api_path: Option<String>,
    pub token: Option<String>,
    pub cmd: String,
}

#[derive(Debug)]
pub struct ActiveConnection {
    pub serial: u64,
    pub url: String,
    pub source_kind: SourceKind,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub release: Option<ReleaseTarget>,
    cancel: CancellationToken,
}

/// Listing view of an active connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub device_id: String,
    pub channel_id: String,
    pub source_kind: SourceKind,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
}

pub struct ConnectionRegistry {
    active: Mutex<HashMap<ConnectionKey, ActiveConnection>>,
    guards: Mutex<HashMap<String, Instant>>,
    next_serial: AtomicU64,
    guard_window: Duration,
    max_age: Duration,
}

/// Keeps a registry entry alive for the lifetime of one piped stream
pub struct ConnectionLease {
    registry: Arc<ConnectionRegistry>,
    key: ConnectionKey,
    serial: u64,
    cancel: CancellationToken,
}

impl ConnectionLease {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.registry.remove_owned(&self.key, self.serial) {
            debug!(device = %self.key.0, channel = %self.key.1, serial = self.serial, "stream ended, connection released");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard key for an upstream URL: fragment removed and volatile token
/// parameters dropped, so relinks of the same stream compare equal
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !VOLATILE_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}

impl ConnectionRegistry {
    pub fn new(guard_window: Duration, max_age: Duration) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            guard_window,
            max_age,
        }
    }

    /// Claim the in-flight guard for `url`. Returns false when the same
    /// normalized URL was claimed less than the guard window ago.
    pub fn try_guard(&self, url: &str) -> bool {
        let key = normalize_url(url);
        let mut guards = lock(&self.guards);
        match guards.get(&key) {
            Some(claimed) if claimed.elapsed() < self.guard_window => false,
            _ => {
                guards.insert(key, Instant::now());
                true
            }
        }
    }

    /// Register a connection for `key`, cancelling any entry it replaces
    pub fn register(
        self: &Arc<Self>,
        key: ConnectionKey,
        url: &str,
        source_kind: SourceKind,
        release: Option<ReleaseTarget>,
    ) -> ConnectionLease {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let connection = ActiveConnection {
            serial,
            url: url.to_string(),
            source_kind,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            release,
            cancel: cancel.clone(),
        };

        let mut active = lock(&self.active);
        if let Some(previous) = active.insert(key.clone(), connection) {
            previous.cancel.cancel();
        }
        ACTIVE_STREAMS.set(active.len() as i64);
        drop(active);

        info!(device = %key.0, channel = %key.1, serial, kind = %source_kind, "stream registered");

        ConnectionLease {
            registry: Arc::clone(self),
            key,
            serial,
            cancel,
        }
    }

    fn remove_owned(&self, key: &ConnectionKey, serial: u64) -> bool {
        let mut active = lock(&self.active);
        let owned = active.get(key).is_some_and(|c| c.serial == serial);
        if owned {
            active.remove(key);
            ACTIVE_STREAMS.set(active.len() as i64);
        }
        owned
    }

    /// Cancel and remove the connection for `key`. Idempotent.
    pub fn kill(&self, key: &ConnectionKey) -> Option<ActiveConnection> {
        let mut active = lock(&self.active);
        let removed = active.remove(key);
        ACTIVE_STREAMS.set(active.len() as i64);
        drop(active);

        if let Some(connection) = &removed {
            connection.cancel.cancel();
            info!(device = %key.0, channel = %key.1, serial = connection.serial, "stream terminated");
        }
        removed
    }

    /// Evict connections older than the max age and expired guard entries
    pub fn reap(&self) -> Vec<(ConnectionKey, ActiveConnection)> {
        let mut active = lock(&self.active);
        let stale: Vec<ConnectionKey> = active
            .iter()
            .filter(|(_, c)| c.started_at.elapsed() >= self.max_age)
            .map(|(k, _)| k.clone())
            .collect();
        let evicted: Vec<(ConnectionKey, ActiveConnection)> = stale
            .into_iter()
            .filter_map(|key| active.remove(&key).map(|c| (key, c)))
            .collect();
        ACTIVE_STREAMS.set(active.len() as i64);
        drop(active);

        for (key, connection) in &evicted {
            connection.cancel.cancel();
            info!(device = %key.0, channel = %key.1, serial = connection.serial, "stale stream reaped");
        }

        lock(&self.guards).retain(|_, claimed| claimed.elapsed() < self.guard_window);
        evicted
    }

    /// Cancel and remove every connection (shutdown)
    pub fn kill_all(&self) -> Vec<(ConnectionKey, ActiveConnection)> {
        let mut active = lock(&self.active);
        let drained: Vec<(ConnectionKey, ActiveConnection)> = active.drain().collect();
        ACTIVE_STREAMS.set(0);
        drop(active);

        for (_, connection) in &drained {
            connection.cancel.cancel();
        }
        drained
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        lock(&self.active).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = lock(&self.active)
            .iter()
            .map(|((device, channel), c)| ConnectionInfo {
                device_id: device.clone(),
                channel_id: channel.clone(),
                source_kind: c.source_kind,
                url: c.url.clone(),
                started_at: c.started_wall,
                age_secs: c.started_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }
}
