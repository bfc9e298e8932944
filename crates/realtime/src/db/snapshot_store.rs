// Durable scene graph snapshots, one row per (site_id, version).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use super::pool::check_pool_health;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    pub version_id: Uuid,
    /// Full document state as a v1 update.
    pub state: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    version_id: Uuid,
    state: Vec<u8>,
    updated_at: DateTime<Utc>,
}

impl From<SnapshotRow> for PersistedSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self { version_id: row.version_id, state: row.state, updated_at: row.updated_at }
    }
}

#[derive(Clone)]
pub enum SnapshotStore {
    Postgres(PgPool),
    Memory(Arc<MemorySnapshotStore>),
}

impl SnapshotStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemorySnapshotStore::default()))
    }

    /// Missing rows are `Ok(None)`; only I/O and query failures are errors.
    pub async fn load_scene_graph(
        &self,
        site_id: &str,
        version: &str,
    ) -> Result<Option<PersistedSnapshot>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, SnapshotRow>(
                    "
                    SELECT version_id, state, updated_at
                    FROM scene_graph_snapshots
                    WHERE site_id = $1
                      AND version = $2
                    ",
                )
                .bind(site_id)
                .bind(version)
                .fetch_optional(pool)
                .instrument(info_span!("realtime.db.query", query = "load_scene_graph"))
                .await
                .with_context(|| format!("failed to load scene graph for {site_id}:{version}"))?;

                Ok(row.map(PersistedSnapshot::from))
            }
            Self::Memory(store) => store.load(site_id, version).await,
        }
    }

    /// Row-atomic upsert of the full state. Failures are logged and reported
    /// as `false` so the caller can retry.
    pub async fn save_scene_graph(&self, site_id: &str, version: &str, state: &[u8]) -> bool {
        let result = match self {
            Self::Postgres(pool) => sqlx::query(
                "
                INSERT INTO scene_graph_snapshots (site_id, version, version_id, state, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (site_id, version) DO UPDATE
                SET state = EXCLUDED.state,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(site_id)
            .bind(version)
            .bind(Uuid::new_v4())
            .bind(state)
            .execute(pool)
            .instrument(info_span!(
                "realtime.db.query",
                query = "save_scene_graph",
                payload_bytes = state.len()
            ))
            .await
            .map(|_| ())
            .context("failed to upsert scene graph snapshot"),
            Self::Memory(store) => store.save(site_id, version, state).await,
        };

        match result {
            Ok(()) => true,
            Err(error) => {
                error!(site_id, version, error = %format!("{error:#}"), "scene graph save failed");
                false
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        match self {
            Self::Postgres(pool) => check_pool_health(pool).await.is_ok(),
            Self::Memory(store) => !store.fail_health.load(Ordering::SeqCst),
        }
    }

    pub async fn close(&self) {
        if let Self::Postgres(pool) = self {
            pool.close().await;
        }
    }
}

/// In-process snapshot table with switchable failures, used for local runs
/// without a database and by the test suites.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rows: RwLock<HashMap<(String, String), PersistedSnapshot>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    fail_health: AtomicBool,
    load_delay_ms: AtomicU64,
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

impl MemorySnapshotStore {
    async fn load(&self, site_id: &str, version: &str) -> Result<Option<PersistedSnapshot>> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            bail!("injected load failure for {site_id}:{version}");
        }
        Ok(self.rows.read().await.get(&(site_id.to_string(), version.to_string())).cloned())
    }

    async fn save(&self, site_id: &str, version: &str, state: &[u8]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            bail!("injected save failure for {site_id}:{version}");
        }

        let mut rows = self.rows.write().await;
        let key = (site_id.to_string(), version.to_string());
        let version_id = rows.get(&key).map(|row| row.version_id).unwrap_or_else(Uuid::new_v4);
        rows.insert(key, PersistedSnapshot { version_id, state: state.to_vec(), updated_at: Utc::now() });
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::SeqCst);
    }

    /// Loads that start after this call take `delay`; zero turns it off.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful saves since creation.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn failed_save_count(&self) -> u64 {
        self.failed_saves.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self, site_id: &str, version: &str) -> Option<PersistedSnapshot> {
        self.rows.read().await.get(&(site_id.to_string(), version.to_string())).cloned()
    }

    /// Writes raw bytes bypassing the save path, e.g. to seed a corrupt row.
    pub async fn put_raw(&self, site_id: &str, version: &str, state: Vec<u8>) {
        self.rows.write().await.insert(
            (site_id.to_string(), version.to_string()),
            PersistedSnapshot { version_id: Uuid::new_v4(), state, updated_at: Utc::now() },
        );
    }
}
