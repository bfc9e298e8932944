// Shared coordination store: cross-process connection counters, process
// stats snapshots and TTL-bound token storage.

pub mod tokens;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, Instrument};

pub use tokens::{token_key, TokenNamespace};

pub const ROOM_CONNECTIONS_KEY: &str = "scenesync:room_connections";
pub const PROCESS_STATS_PREFIX: &str = "scenesync:process_stats";

/// HINCRBY -1 and the zero-floor HDEL run as one script so another process's
/// increment cannot land between them.
const DECREMENT_CONNECTIONS_SCRIPT: &str = r"
local count = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if count <= 0 then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return count
";

pub fn process_stats_key(process_id: &str) -> String {
    format!("{PROCESS_STATS_PREFIX}:{process_id}")
}

#[derive(Clone)]
pub enum CoordinationStore {
    Redis(ConnectionManager),
    Memory(Arc<MemoryCoordinationStore>),
}

impl CoordinationStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("failed to parse Redis URL")?;
        let manager =
            ConnectionManager::new(client).await.context("failed to connect to Redis")?;
        Ok(Self::Redis(manager))
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryCoordinationStore::default()))
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let pong: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .instrument(info_span!("realtime.redis.command", command = "PING"))
                    .await
                    .context("Redis ping failed")?;
                if pong != "PONG" {
                    bail!("unexpected Redis ping reply: {pong}");
                }
                Ok(())
            }
            Self::Memory(store) => store.check_available(),
        }
    }

    /// Returns the room's new cross-process connection count.
    pub async fn increment_connections(&self, room_id: &str) -> Result<i64> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let count: i64 = conn
                    .hincr(ROOM_CONNECTIONS_KEY, room_id, 1)
                    .instrument(info_span!("realtime.redis.command", command = "HINCRBY"))
                    .await
                    .with_context(|| format!("failed to increment connections for {room_id}"))?;
                Ok(count)
            }
            Self::Memory(store) => store.adjust_connections(room_id, 1).await,
        }
    }

    /// Decrements the room's counter; a count that reaches zero removes the
    /// field so idle rooms do not accumulate in the hash.
    pub async fn decrement_connections(&self, room_id: &str) -> Result<i64> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let script = redis::Script::new(DECREMENT_CONNECTIONS_SCRIPT);
                let count: i64 = script
                    .key(ROOM_CONNECTIONS_KEY)
                    .arg(room_id)
                    .invoke_async(&mut conn)
                    .instrument(info_span!("realtime.redis.command", command = "EVALSHA"))
                    .await
                    .with_context(|| format!("failed to decrement connections for {room_id}"))?;
                Ok(count.max(0))
            }
            Self::Memory(store) => store.adjust_connections(room_id, -1).await,
        }
    }

    pub async fn connection_counts(&self) -> Result<HashMap<String, i64>> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let counts: HashMap<String, i64> = conn
                    .hgetall(ROOM_CONNECTIONS_KEY)
                    .instrument(info_span!("realtime.redis.command", command = "HGETALL"))
                    .await
                    .context("failed to read room connection counts")?;
                Ok(counts)
            }
            Self::Memory(store) => {
                store.check_available()?;
                Ok(store.counters.lock().await.clone())
            }
        }
    }

    /// Publishes this process's room stats under a key that expires unless
    /// refreshed, so dead processes drop out on their own.
    pub async fn publish_process_stats(
        &self,
        process_id: &str,
        stats: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let payload = serde_json::to_string(stats).context("failed to encode process stats")?;
        self.set(&process_stats_key(process_id), &payload, ttl.as_secs().max(1)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let _: () = conn
                    .set_ex(key, value, ttl_seconds)
                    .instrument(info_span!("realtime.redis.command", command = "SETEX"))
                    .await
                    .with_context(|| format!("failed to set {key}"))?;
                Ok(())
            }
            Self::Memory(store) => store.set(key, value, ttl_seconds).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let value: Option<String> = conn
                    .get(key)
                    .instrument(info_span!("realtime.redis.command", command = "GET"))
                    .await
                    .with_context(|| format!("failed to get {key}"))?;
                Ok(value)
            }
            Self::Memory(store) => store.get(key).await,
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let _: i64 = conn
                    .del(key)
                    .instrument(info_span!("realtime.redis.command", command = "DEL"))
                    .await
                    .with_context(|| format!("failed to delete {key}"))?;
                Ok(())
            }
            Self::Memory(store) => {
                store.check_available()?;
                store.values.lock().await.remove(key);
                Ok(())
            }
        }
    }
}

/// In-process stand-in with lazy TTL expiry and a switchable outage.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    counters: Mutex<HashMap<String, i64>>,
    values: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn connections_for(&self, room_id: &str) -> i64 {
        self.counters.lock().await.get(room_id).copied().unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("coordination store unavailable");
        }
        Ok(())
    }

    async fn adjust_connections(&self, room_id: &str, delta: i64) -> Result<i64> {
        self.check_available()?;
        let mut counters = self.counters.lock().await;
        let count = counters.get(room_id).copied().unwrap_or(0) + delta;
        if count <= 0 {
            counters.remove(room_id);
        } else {
            counters.insert(room_id.to_string(), count);
        }
        Ok(count.max(0))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.check_available()?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        self.values.lock().await.insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut values = self.values.lock().await;
        match values.get(key) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => {
                values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }
}
