// Realtime server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Pool tuning lives in `db::pool` but is parsed through the
// same lookup function so tests can drive everything from a map.

use std::net::SocketAddr;
use std::time::Duration;

use crate::db::pool::PoolConfig;
use crate::rate_limit::RateLimitConfig;
use crate::room::persistence::PersistencePolicy;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Room lifecycle tuning shared by the registry and every room actor.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub persistence: PersistencePolicy,
    /// How long an empty room stays in memory before it is torn down.
    pub drain_grace: Duration,
    /// Per-connection outbound frame queue; a full queue evicts the client.
    pub outbound_queue_capacity: usize,
    /// Pending commands per room actor; joiners wait for space.
    pub command_queue_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            persistence: PersistencePolicy::default(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
        }
    }
}

/// Core realtime server configuration.
///
/// Constructed via [`RealtimeConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Unset runs against an in-memory store.
    pub database_url: Option<String>,
    /// Redis connection string. Unset runs against an in-memory store.
    pub redis_url: Option<String>,
    pub pool: PoolConfig,
    /// Apply embedded migrations on startup.
    pub run_migrations: bool,
    pub rate_limit: RateLimitConfig,
    pub room: RoomConfig,
    /// Upper bound for the shutdown flush of all rooms.
    pub shutdown_timeout: Duration,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `scenesync_realtime=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RealtimeConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SCENESYNC_HOST` | `0.0.0.0` |
    /// | `SCENESYNC_PORT` (or `PORT`) | `8080` |
    /// | `SCENESYNC_DATABASE_URL` | *(none: in-memory store)* |
    /// | `SCENESYNC_REDIS_URL` | *(none: in-memory store)* |
    /// | `SCENESYNC_DB_RUN_MIGRATIONS` | `true` |
    /// | `SCENESYNC_RATE_LIMIT_MAX_REQUESTS` | `100` |
    /// | `SCENESYNC_RATE_LIMIT_WINDOW_MS` | `60000` |
    /// | `SCENESYNC_SAVE_DEBOUNCE_MS` | `2000` |
    /// | `SCENESYNC_SAVE_MAX_INTERVAL_MS` | `10000` |
    /// | `SCENESYNC_ROOM_DRAIN_GRACE_MS` | `30000` |
    /// | `SCENESYNC_OUTBOUND_QUEUE_CAPACITY` | `256` |
    /// | `SCENESYNC_ROOM_COMMAND_QUEUE` | `1024` |
    /// | `SCENESYNC_SHUTDOWN_TIMEOUT_MS` | `10000` |
    /// | `SCENESYNC_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `SCENESYNC_LOG_FILTER` | `info` |
    /// | `SCENESYNC_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("SCENESYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = parse_var::<u16, _>(&env, "SCENESYNC_PORT")
            .or_else(|| parse_var::<u16, _>(&env, "PORT"))
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("SCENESYNC_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let redis_url = env("SCENESYNC_REDIS_URL").ok().filter(|url| !url.is_empty());
        let run_migrations = parse_bool(&env, "SCENESYNC_DB_RUN_MIGRATIONS").unwrap_or(true);

        let rate_limit_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_requests: parse_var::<u32, _>(&env, "SCENESYNC_RATE_LIMIT_MAX_REQUESTS")
                .filter(|value| *value > 0)
                .unwrap_or(rate_limit_defaults.max_requests),
            window: parse_millis(&env, "SCENESYNC_RATE_LIMIT_WINDOW_MS")
                .unwrap_or(rate_limit_defaults.window),
            ..rate_limit_defaults
        };

        let persistence_defaults = PersistencePolicy::default();
        let persistence = PersistencePolicy {
            debounce: parse_millis(&env, "SCENESYNC_SAVE_DEBOUNCE_MS")
                .unwrap_or(persistence_defaults.debounce),
            max_interval: parse_millis(&env, "SCENESYNC_SAVE_MAX_INTERVAL_MS")
                .unwrap_or(persistence_defaults.max_interval),
            ..persistence_defaults
        };

        let room = RoomConfig {
            persistence,
            drain_grace: parse_millis(&env, "SCENESYNC_ROOM_DRAIN_GRACE_MS")
                .unwrap_or(DEFAULT_DRAIN_GRACE),
            outbound_queue_capacity: parse_var::<usize, _>(&env, "SCENESYNC_OUTBOUND_QUEUE_CAPACITY")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
            command_queue_capacity: parse_var::<usize, _>(&env, "SCENESYNC_ROOM_COMMAND_QUEUE")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_COMMAND_QUEUE_CAPACITY),
        };

        let shutdown_timeout = parse_millis(&env, "SCENESYNC_SHUTDOWN_TIMEOUT_MS")
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        let cors_origins = env("SCENESYNC_CORS_ORIGINS").ok();
        let log_filter = env("SCENESYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("SCENESYNC_LOG_FORMAT").ok().as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            database_url,
            redis_url,
            pool: PoolConfig::from_env_fn(&env),
            run_migrations,
            rate_limit,
            room,
            shutdown_timeout,
            cors_origins,
            log_filter,
            log_format,
        }
    }
}

pub(crate) fn parse_var<T, F>(env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_millis<F>(env: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    parse_var::<u64, _>(env, key).filter(|value| *value > 0).map(Duration::from_millis)
}

fn parse_bool<F>(env: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
