use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Read an environment variable, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub app_env: String,

    // PostgreSQL
    pub database_url: String,
    pub db_max_connections: u32,

    // Redis (optional mirror for sync progress)
    pub redis_url: Option<String>,

    // Sync
    pub sync_batch_size: usize,
    pub genre_fetch_concurrency: usize,
    pub refresh_interval_secs: u64,

    // Upstream calls
    pub portal_timeout_ms: u64,
    pub xtream_timeout_ms: u64,
    pub m3u_fetch_timeout_ms: u64,
    pub upstream_connect_timeout_ms: u64,

    // Gateway
    pub settle_delay_ms: u64,
    pub url_guard_ms: u64,
    pub reaper_interval_secs: u64,
    pub max_connection_age_secs: u64,

    // Caches
    pub session_ttl_secs: u64,
    pub url_cache_ttl_secs: u64,
    pub cache_capacity: usize,

    // Client identities
    pub user_agent: String,
    pub portal_user_agent: String,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            // Server
            port: env_or("PORT", 3001),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),

            // PostgreSQL
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/channel_gateway".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 15),

            // Redis
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),

            // Sync
            sync_batch_size: env_or("SYNC_BATCH_SIZE", 1000usize).clamp(1000, 2000),
            genre_fetch_concurrency: env_or("GENRE_FETCH_CONCURRENCY", 6usize).clamp(5, 8),
            refresh_interval_secs: env_or("REFRESH_INTERVAL_SECS", 600), // 10 minutes

            // Upstream calls
            portal_timeout_ms: env_or("PORTAL_TIMEOUT_MS", 15_000),
            xtream_timeout_ms: env_or("XTREAM_TIMEOUT_MS", 30_000),
            m3u_fetch_timeout_ms: env_or("M3U_FETCH_TIMEOUT_MS", 300_000), // 5 minutes, large playlists
            upstream_connect_timeout_ms: env_or("UPSTREAM_CONNECT_TIMEOUT_MS", 15_000),

            // Gateway
            settle_delay_ms: env_or("SETTLE_DELAY_MS", 200),
            url_guard_ms: env_or("URL_GUARD_MS", 3_000),
            reaper_interval_secs: env_or("REAPER_INTERVAL_SECS", 60),
            max_connection_age_secs: env_or("MAX_CONNECTION_AGE_SECS", 300),

            // Caches
            session_ttl_secs: env_or("SESSION_TTL_SECS", 600),
            url_cache_ttl_secs: env_or("URL_CACHE_TTL_SECS", 300),
            cache_capacity: env_or("CACHE_CAPACITY", 10_000),

            // Use VLC user agent to avoid IPTV server blocks
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| "VLC/3.0.20 LibVLC/3.0.20".to_string()),
            portal_user_agent: env::var("PORTAL_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 (KHTML, like Gecko) MAG200 stbapp ver: 2 rev: 250 Safari/533.3".to_string()
            }),
        }
    }

    pub fn portal_timeout(&self) -> Duration {
        Duration::from_millis(self.portal_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
