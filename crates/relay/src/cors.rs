// CORS middleware configuration for the relay server.
//
// Allowed origins come from `RelayConfig::cors_origins`
// (`TRACKCAST_CORS_ORIGINS`, comma-separated). Falls back to localhost
// defaults in development.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Default origins allowed when no origin list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] for the configured origin list.
///
/// - `"*"` allows any origin, without credentials.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// Credentialed configurations let browsers send the booking-token cookie.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
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
    use axum::{
        body::Body,
        http::{Request, Response},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn preflight(origins: Option<&str>, origin: &str, method: &str) -> Response<Body> {
        Router::new()
            .route("/view/{booking_id}", get(|| async { "ok" }))
            .layer(cors_layer(origins))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/view/B1")
                    .header("origin", origin)
                    .header("access-control-request-method", method)
                    .body(Body::empty())
                    .expect("preflight request should build"),
            )
            .await
            .expect("preflight should return a response")
    }

    #[tokio::test]
    async fn preflight_returns_cors_headers_for_allowed_origin() {
        let response = preflight(None, "http://localhost:3000", "DELETE").await;

        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow-origin"),
            "http://localhost:3000"
        );
        assert_eq!(
            response.headers().get("access-control-allow-credentials").expect("credentials"),
            "true"
        );
        assert_eq!(response.headers().get("access-control-max-age").expect("max-age"), "3600");
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response = preflight(None, "https://evil.example.com", "POST").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_defaults() {
        let origins = Some("https://rides.example.com,https://ops.example.com");

        let response = preflight(origins, "https://ops.example.com", "PATCH").await;
        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow-origin"),
            "https://ops.example.com"
        );

        let response = preflight(origins, "http://localhost:3000", "GET").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response = preflight(Some("*"), "https://anything.example.com", "GET").await;

        assert_eq!(response.headers().get("access-control-allow-origin").expect("allow-origin"), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins, vec!["https://a.com", "https://b.com"]);
    }
}
