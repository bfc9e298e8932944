use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Stable error codes for the HTTP surface. WebSocket errors use the
/// protocol's own codes in `scenesync_common::protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    RoomNotFound,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::NotFound | Self::RoomNotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A client may repeat the same request later and expect it to succeed.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::InternalError)
    }

    const fn default_message(self) -> &'static str {
        match self {
            Self::NotFound => "requested resource not found",
            Self::RoomNotFound => "room is not active on this server",
            Self::RateLimited => "too many connection attempts for this room",
            Self::InternalError => "internal server error",
        }
    }
}

/// JSON error body returned by every HTTP endpoint. The request id comes
/// from the surrounding request scope.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    retryable: bool,
    request_id: Option<&'a str>,
    details: &'a Value,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}) }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code.as_str(),
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
                details: &self.details,
            },
        };
        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = &request_id {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

/// Runs `future` with `request_id` visible to any `ApiError` built inside it.
pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Honours a caller-supplied id unless it is blank.
pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.trim().is_empty() => value.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
