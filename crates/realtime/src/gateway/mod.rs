// HTTP surface of the realtime server: health, room stats, metrics and the
// WebSocket upgrade route.

pub mod client_ip;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use scenesync_common::protocol::PROTOCOL_VERSION;
use serde_json::{json, Value};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::coordination::CoordinationStore;
use crate::cors::{cors_layer, preflight_no_content};
use crate::db::SnapshotStore;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope, ApiError,
    ErrorCode,
};
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::registry::{RoomRegistry, ShutdownReport};
pub use ws::HeartbeatConfig;

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
pub const SERVICE_NAME: &str = "scenesync-realtime";
pub const WS_PATH_TEMPLATE: &str = "/ws/{siteId}/{version}";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub snapshots: SnapshotStore,
    pub coordination: CoordinationStore,
    pub heartbeat: HeartbeatConfig,
    /// Upgraded sockets; each one owns a shared-counter decrement.
    pub connections: TaskTracker,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<RoomRegistry>,
        rate_limiter: Arc<RateLimiter>,
        snapshots: SnapshotStore,
        coordination: CoordinationStore,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            snapshots,
            coordination,
            heartbeat: HeartbeatConfig::default(),
            connections: TaskTracker::new(),
            started_at: Instant::now(),
        }
    }

    /// Flushes every room, then waits for the socket tasks the flush closed
    /// so their shared-counter decrements land before the stores go away.
    /// Both phases share one `timeout` budget.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let deadline = tokio::time::Instant::now() + timeout;
        let report = self.registry.shutdown(timeout).await;

        self.connections.close();
        if tokio::time::timeout_at(deadline, self.connections.wait()).await.is_err() {
            warn!(
                remaining = self.connections.len(),
                "connections still open after shutdown timeout"
            );
        }
        report
    }
}

pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let router = Router::new()
        .route("/", get(service_metadata))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/rooms", get(list_rooms))
        .route("/rooms/{room_id}/stats", get(room_stats))
        .route("/metrics", get(render_metrics))
        .route("/ws/{*path}", get(ws::ws_upgrade))
        .fallback(not_found)
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(middleware::from_fn(preflight_no_content));
    apply_middleware(router)
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let route = request.extensions().get::<MatchedPath>().map(|matched| matched.as_str().to_owned());
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(
        method.as_str(),
        route.as_deref(),
        response.status().as_u16(),
        latency_ms,
    );
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}

async fn service_metadata(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "websocket_path": WS_PATH_TEMPLATE,
        "active_rooms": state.registry.room_count().await,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    dependency_report(&state, false).await
}

async fn ready(State(state): State<AppState>) -> Response {
    dependency_report(&state, true).await
}

/// Checks both stores concurrently, each bounded by a timeout.
async fn dependency_report(state: &AppState, require_accepting: bool) -> Response {
    let database = async {
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.snapshots.health_check()).await,
            Ok(true)
        )
    };
    let coordination = async {
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, state.coordination.ping()).await,
            Ok(Ok(()))
        )
    };
    let (database_ok, coordination_ok) = tokio::join!(database, coordination);

    let mut checks = json!({
        "database": check_label(database_ok),
        "coordination": check_label(coordination_ok),
    });
    let mut healthy = database_ok && coordination_ok;
    if require_accepting {
        let accepting = !state.registry.is_shutting_down();
        checks["accepting_connections"] = json!(accepting);
        healthy &= accepting;
    }

    let (status, label) =
        if healthy { (StatusCode::OK, "ok") } else { (StatusCode::SERVICE_UNAVAILABLE, "unavailable") };
    (status, Json(json!({ "status": label, "checks": checks }))).into_response()
}

fn check_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "unavailable"
    }
}

async fn list_rooms(State(state): State<AppState>) -> Json<Value> {
    let local = state.registry.stats().await;
    let (cluster, cluster_error) = match state.coordination.connection_counts().await {
        Ok(counts) => (json!(counts), Value::Null),
        Err(error) => (Value::Null, json!(format!("{error:#}"))),
    };

    Json(json!({
        "total_rooms": local.total_rooms,
        "total_connections": local.total_connections,
        "dirty_rooms": local.dirty_rooms,
        "rooms": local.rooms,
        "cluster": cluster,
        "cluster_error": cluster_error,
    }))
}

async fn room_stats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .room_stats(&room_id)
        .await
        .map(|stats| Json(json!(stats)))
        .ok_or_else(|| {
            ApiError::from_code(ErrorCode::RoomNotFound).with_details(json!({ "room_id": room_id }))
        })
}

async fn render_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::global().render_prometheus(),
    )
        .into_response()
}

async fn not_found() -> ApiError {
    ApiError::from_code(ErrorCode::NotFound)
}
