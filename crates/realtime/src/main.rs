use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use scenesync_realtime::config::{LogFormat, RealtimeConfig};
use scenesync_realtime::coordination::CoordinationStore;
use scenesync_realtime::db::migrations::run_migrations;
use scenesync_realtime::db::pool::create_pg_pool;
use scenesync_realtime::db::SnapshotStore;
use scenesync_realtime::gateway::{build_router, AppState};
use scenesync_realtime::rate_limit::RateLimiter;
use scenesync_realtime::registry::RoomRegistry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const PROCESS_STATS_INTERVAL: Duration = Duration::from_secs(15);
const PROCESS_STATS_TTL: Duration = Duration::from_secs(45);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RealtimeConfig::from_env();
    init_tracing(&config);

    let snapshots = match &config.database_url {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, &config.pool)
                .await
                .context("failed to initialize PostgreSQL pool")?;
            if config.run_migrations {
                run_migrations(&pool).await.context("failed to run database migrations")?;
            }
            SnapshotStore::Postgres(pool)
        }
        None => {
            warn!("SCENESYNC_DATABASE_URL is not set; snapshots are kept in memory only");
            SnapshotStore::memory()
        }
    };

    let coordination = match &config.redis_url {
        Some(redis_url) => CoordinationStore::connect(redis_url)
            .await
            .context("failed to initialize coordination store")?,
        None => {
            warn!("SCENESYNC_REDIS_URL is not set; connection counts are process-local");
            CoordinationStore::memory()
        }
    };

    let registry = Arc::new(RoomRegistry::new(snapshots.clone(), config.room.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
    let sweeper = rate_limiter.spawn_sweeper();
    let process_id = Uuid::new_v4().to_string();
    let stats_publisher =
        spawn_stats_publisher(Arc::clone(&registry), coordination.clone(), process_id.clone());

    let state = AppState::new(registry, rate_limiter, snapshots.clone(), coordination);
    let app = build_router(state.clone(), config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind realtime listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, %process_id, "starting realtime server");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("realtime server exited unexpectedly")?;

    // Upgraded sockets outlive `serve`; this also waits for them to unwind.
    let report = state.shutdown(config.shutdown_timeout).await;
    if report.failed > 0 || report.timed_out > 0 {
        error!(failed = report.failed, timed_out = report.timed_out, "some rooms were not flushed");
    }
    sweeper.abort();
    stats_publisher.abort();
    snapshots.close().await;

    info!(flushed = report.flushed, "realtime server stopped");
    Ok(())
}

fn init_tracing(config: &RealtimeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Refreshes this process's stats in the coordination store until aborted.
fn spawn_stats_publisher(
    registry: Arc<RoomRegistry>,
    coordination: CoordinationStore,
    process_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROCESS_STATS_INTERVAL);
        loop {
            interval.tick().await;
            let stats = registry.stats().await;
            let payload = serde_json::json!({
                "process_id": process_id,
                "total_rooms": stats.total_rooms,
                "total_connections": stats.total_connections,
                "dirty_rooms": stats.dirty_rooms,
                "published_at": chrono::Utc::now(),
            });
            if let Err(error) =
                coordination.publish_process_stats(&process_id, &payload, PROCESS_STATS_TTL).await
            {
                warn!(error = %format!("{error:#}"), "failed to publish process stats");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
