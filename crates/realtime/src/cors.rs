// CORS for the HTTP surface.
//
// Allowed origins come from `SCENESYNC_CORS_ORIGINS` (comma-separated, or
// `*`). When unset, local development origins are allowed.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Default origins allowed when no origin list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] from the configured origin list.
///
/// - `"*"` allows any origin and disables credentials.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// Preflight responses are cached for an hour and `x-request-id` is exposed.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

/// Preflights carry no body; answer them with 204 instead of the layer's 200.
pub async fn preflight_no_content(request: Request<Body>, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, response::IntoResponse, routing::get, Router};
    use tower::ServiceExt;

    async fn ok_handler() -> impl IntoResponse {
        "ok"
    }

    fn test_app(origins: Option<&str>) -> Router {
        Router::new()
            .route("/rooms", get(ok_handler))
            .layer(cors_layer(origins))
            .layer(middleware::from_fn(preflight_no_content))
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/rooms")
            .header("origin", origin)
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn preflight_is_answered_with_204_and_cors_headers() {
        let response = test_app(None).oneshot(preflight("http://localhost:5173")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );
        assert_eq!(response.headers().get("access-control-max-age").unwrap(), "3600");
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response =
            test_app(None).oneshot(preflight("https://evil.example.com")).await.unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let app = test_app(Some("https://editor.scenesync.dev, https://staging.scenesync.dev"));
        let response = app.oneshot(preflight("https://editor.scenesync.dev")).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://editor.scenesync.dev"
        );

        let app = test_app(Some("https://editor.scenesync.dev"));
        let response = app.oneshot(preflight("http://localhost:3000")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response =
            test_app(Some("*")).oneshot(preflight("https://anything.example.com")).await.unwrap();

        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn simple_get_keeps_status_and_gets_cors_header() {
        let response = test_app(None)
            .oneshot(
                Request::builder()
                    .uri("/rooms")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins, vec!["https://a.com", "https://b.com"]);
    }
}
