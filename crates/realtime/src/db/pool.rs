use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::parse_var;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Reject connection strings that do not demand TLS.
    pub require_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            require_tls: true,
        }
    }
}

impl PoolConfig {
    /// Reads `SCENESYNC_DB_MIN_CONNECTIONS`, `SCENESYNC_DB_MAX_CONNECTIONS`,
    /// `SCENESYNC_DB_ACQUIRE_TIMEOUT_SECS`, `SCENESYNC_DB_IDLE_TIMEOUT_SECS`
    /// and `SCENESYNC_DB_REQUIRE_TLS`.
    pub(crate) fn from_env_fn<F>(env: &F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let min_connections = parse_var::<u32, _>(env, "SCENESYNC_DB_MIN_CONNECTIONS")
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);
        let max_connections = parse_var::<u32, _>(env, "SCENESYNC_DB_MAX_CONNECTIONS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(min_connections);
        let acquire_timeout_secs = parse_var::<u64, _>(env, "SCENESYNC_DB_ACQUIRE_TIMEOUT_SECS")
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);
        let idle_timeout_secs = parse_var::<u64, _>(env, "SCENESYNC_DB_IDLE_TIMEOUT_SECS")
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let require_tls = parse_var::<bool, _>(env, "SCENESYNC_DB_REQUIRE_TLS").unwrap_or(true);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            require_tls,
        }
    }
}

pub async fn create_pg_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse PostgreSQL connection options")?;
    if config.require_tls {
        ensure_postgres_tls(&connect_options)?;
    }

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to PostgreSQL")
}

fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "PostgreSQL connection must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter) or SCENESYNC_DB_REQUIRE_TLS=false."
        ),
    }
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("PostgreSQL health check failed")?;

    Ok(())
}
