// WebSocket upgrade handler and per-connection socket pump.
//
// The upgrade handler validates the room path and applies the rate limit
// before any handshake. After the upgrade, `serve_socket` owns the shared
// connection counter and the room membership; the socket itself is pumped
// in a spawned task so a panic there still reaches the cleanup below it.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use scenesync_common::protocol::ws::{
    close_code, decode_message, encode_message, error_code, WsMessage,
};
use scenesync_common::room::RoomKey;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client_ip::ClientIp;
use super::AppState;
use crate::error::{request_id_from_headers_or_generate, ApiError, ErrorCode};
use crate::metrics;
use crate::room::{CloseSignal, ConnectionInfo, ConnectionSink, RoomHandle};

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
/// The room dropped this connection without saying why.
const ROOM_CLOSED: CloseSignal = CloseSignal { code: close_code::INTERNAL, reason: "room_closed" };

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Connections with no pong for this long are dropped.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_HEARTBEAT_INTERVAL, timeout: DEFAULT_HEARTBEAT_TIMEOUT }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityQuery {
    user_id: Option<String>,
    name: Option<String>,
    color: Option<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("binary frames are not supported; send JSON text frames")]
    Binary,
    #[error("invalid frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FrameError {
    fn into_error_frame(self) -> WsMessage {
        WsMessage::error(error_code::INVALID_FRAME, self.to_string(), false)
    }
}

pub fn decode_text_frame(raw: &str) -> Result<WsMessage, FrameError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge);
    }
    Ok(decode_message(raw)?)
}

pub async fn ws_upgrade(
    Path(tail): Path<String>,
    Query(identity): Query<IdentityQuery>,
    ClientIp(client_ip): ClientIp,
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let key = match RoomKey::from_ws_path(&tail) {
        Ok(key) => key,
        Err(error) => {
            debug!(path = %tail, %error, "rejected websocket path");
            return ApiError::new(ErrorCode::NotFound, "websocket path must be /ws/{siteId}/{version}")
                .with_details(json!({ "reason": error.to_string() }))
                .into_response();
        }
    };
    let room_id = key.room_id();

    let decision = state.rate_limiter.check_rate_limit(&room_id, &client_ip);
    if !decision.allowed {
        metrics::increment_rate_limited_upgrades();
        warn!(%room_id, %client_ip, retry_after_ms = ?decision.retry_after_ms, "rate limit exceeded");
        let mut response = ApiError::from_code(ErrorCode::RateLimited)
            .with_details(json!({ "retry_after_ms": decision.retry_after_ms }))
            .into_response();
        if let Some(seconds) = decision.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        return response;
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let info = ConnectionInfo {
        connection_id: Uuid::new_v4(),
        user_id: identity
            .user_id
            .filter(|user_id| !user_id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: identity.name.filter(|name| !name.is_empty()),
        color: identity.color.filter(|color| !color.is_empty()),
    };
    let request_id = request_id_from_headers_or_generate(&headers);
    debug!(%room_id, %client_ip, %request_id, connection_id = %info.connection_id, "upgrading websocket");

    let connections = state.connections.clone();
    upgrade
        .max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| connections.track_future(serve_socket(state, key, info, socket)))
}

async fn serve_socket(state: AppState, key: RoomKey, info: ConnectionInfo, mut socket: WebSocket) {
    let room_id = key.room_id();
    let connection_id = info.connection_id;

    let counted = match state.coordination.increment_connections(&room_id).await {
        Ok(_) => true,
        Err(error) => {
            warn!(%room_id, error = %format!("{error:#}"), "failed to increment shared connection count");
            false
        }
    };
    metrics::adjust_active_connections(1);

    let (sink, outbound, close) = ConnectionSink::channel(state.registry.config().outbound_queue_capacity);
    match state.registry.handle_connection(&key, info, sink).await {
        Ok(room) => {
            let pump = tokio::spawn(pump_socket(
                socket,
                room.clone(),
                connection_id,
                outbound,
                close,
                state.heartbeat,
            ));
            if let Err(join_error) = pump.await {
                error!(%room_id, %connection_id, ?join_error, "connection task panicked");
            }
            room.leave(connection_id).await;
        }
        Err(error) => {
            warn!(%room_id, %connection_id, %error, "room join failed");
            close_socket(&mut socket, error.close_code(), error.to_string()).await;
        }
    }

    metrics::adjust_active_connections(-1);
    if counted {
        if let Err(error) = state.coordination.decrement_connections(&room_id).await {
            warn!(%room_id, error = %format!("{error:#}"), "failed to decrement shared connection count");
        }
    }
    info!(%room_id, %connection_id, "connection closed");
}

async fn pump_socket(
    mut socket: WebSocket,
    room: RoomHandle,
    connection_id: Uuid,
    mut outbound: mpsc::Receiver<WsMessage>,
    mut close: oneshot::Receiver<CloseSignal>,
    heartbeat: HeartbeatConfig,
) {
    let mut heartbeat_interval = tokio::time::interval(heartbeat.interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;

            signal = &mut close => {
                let signal = signal.unwrap_or(ROOM_CLOSED);
                close_socket(&mut socket, signal.code, signal.reason.to_string()).await;
                break;
            }
            maybe_outbound = outbound.recv() => {
                let Some(message) = maybe_outbound else {
                    let signal = close.try_recv().unwrap_or(ROOM_CLOSED);
                    close_socket(&mut socket, signal.code, signal.reason.to_string()).await;
                    break;
                };
                if send_ws_message(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat.timeout {
                    warn!(room_id = %room.room_id(), %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else { break };

                match message {
                    Ok(Message::Text(raw)) => match decode_text_frame(raw.as_str()) {
                        Ok(frame) => {
                            if !room.send_frame(connection_id, frame).await {
                                close_socket(&mut socket, ROOM_CLOSED.code, ROOM_CLOSED.reason.to_string()).await;
                                break;
                            }
                        }
                        Err(FrameError::TooLarge) => {
                            close_socket(&mut socket, close_code::TOO_LARGE, FrameError::TooLarge.to_string()).await;
                            break;
                        }
                        Err(error) => {
                            metrics::record_ws_frame("invalid", true);
                            if send_ws_message(&mut socket, &error.into_error_frame()).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_frame("binary", true);
                        if send_ws_message(&mut socket, &FrameError::Binary.into_error_frame()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_socket(&mut socket, close_code::TOO_LARGE, FrameError::TooLarge.to_string()).await;
                        } else {
                            debug!(%connection_id, %error, "websocket receive failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), axum::Error> {
    match encode_message(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(error) => {
            error!(%error, kind = message.kind(), "failed to encode outbound frame");
            Ok(())
        }
    }
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: String) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
