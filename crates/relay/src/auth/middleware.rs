use crate::{
    auth::{
        booking_token::{BookingClaims, BookingSession},
        identity::{Identity, IdentityTokenService},
    },
    error::{ErrorCode, RelayError},
    session::SessionManager,
};
use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

pub const BOOKING_TOKEN_COOKIE: &str = "booking_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverIdentity(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminIdentity(pub i64);

/// A booking token that passed validation, with its decoded session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedBooking {
    pub claims: BookingClaims,
    pub session: BookingSession,
}

#[derive(Clone)]
pub struct BookingTokenGate {
    pub sessions: SessionManager,
    /// Also require the token to be the driver's current session.
    pub check_remote: bool,
}

pub async fn require_driver(
    State(identity_service): State<Arc<IdentityTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate_identity(&identity_service, request.headers()) {
        Ok(Identity::Driver(driver_id)) => {
            request.extensions_mut().insert(DriverIdentity(driver_id));
            next.run(request).await
        }
        Ok(Identity::Admin(_)) => forbidden_response("driver identity required"),
        Err(response) => response,
    }
}

pub async fn require_admin(
    State(identity_service): State<Arc<IdentityTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate_identity(&identity_service, request.headers()) {
        Ok(Identity::Admin(admin_id)) => {
            request.extensions_mut().insert(AdminIdentity(admin_id));
            next.run(request).await
        }
        Ok(Identity::Driver(_)) => forbidden_response("admin identity required"),
        Err(response) => response,
    }
}

/// Accepts a booking token from the `Authorization` header or the
/// `booking_token` cookie.
pub async fn require_booking_token(
    State(gate): State<BookingTokenGate>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = booking_token_from_headers(request.headers()) else {
        return unauthorized_response("missing booking token");
    };

    let claims = match gate.sessions.validate(&token, gate.check_remote).await {
        Ok(claims) => claims,
        Err(error) => return RelayError::from(error).into_response(),
    };

    let session = gate.sessions.get(&claims);
    request.extensions_mut().insert(AuthenticatedBooking { claims, session });

    next.run(request).await
}

fn authenticate_identity(
    identity_service: &IdentityTokenService,
    headers: &HeaderMap,
) -> Result<Identity, Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| unauthorized_response("missing bearer token"))?;

    identity_service.validate(token).map_err(|_| unauthorized_response("invalid bearer token"))
}

fn booking_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .or_else(|| {
            headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(|cookies| extract_cookie(cookies, BOOKING_TOKEN_COOKIE))
        })
        .map(ToOwned::to_owned)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn extract_cookie<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value)
}

pub fn booking_token_cookie(token: &str, max_age_secs: i64) -> String {
    format!("{BOOKING_TOKEN_COOKIE}={token}; Path=/; Max-Age={max_age_secs}; HttpOnly; SameSite=Lax")
}

pub fn expired_booking_token_cookie() -> String {
    format!("{BOOKING_TOKEN_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

fn forbidden_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthForbidden, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{
        extract_cookie, require_admin, require_booking_token, require_driver,
        AuthenticatedBooking, BookingTokenGate, DriverIdentity,
    };
    use crate::{
        auth::identity::{Identity, IdentityTokenService},
        session::tests::{harness, pickup},
    };
    use axum::{
        body::Body,
        extract::Extension,
        http::{
            header::{AUTHORIZATION, COOKIE},
            Request, StatusCode,
        },
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    const IDENTITY_SECRET: &str = "trackcast_identity_secret_that_is_long_enough";

    fn identity_service() -> Arc<IdentityTokenService> {
        Arc::new(IdentityTokenService::new(IDENTITY_SECRET).expect("service should initialize"))
    }

    fn driver_app(service: Arc<IdentityTokenService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(DriverIdentity(driver_id)): Extension<DriverIdentity>| async move {
                    driver_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(service, require_driver))
    }

    async fn status_of(app: Router, request: Request<Body>) -> StatusCode {
        app.oneshot(request).await.expect("request should return a response").status()
    }

    fn get_request(authorization: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().uri("/protected");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let status = status_of(driver_app(identity_service()), get_request(None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let status = status_of(
            driver_app(identity_service()),
            get_request(Some("Bearer invalid-token".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn injects_driver_identity_for_valid_token() {
        let service = identity_service();
        let token = service.issue(Identity::Driver(7), 60).expect("token should be issued");

        let status =
            status_of(driver_app(service), get_request(Some(format!("Bearer {token}")))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn roles_are_not_interchangeable() {
        let service = identity_service();
        let admin = service.issue(Identity::Admin(1), 60).expect("token should be issued");
        let driver = service.issue(Identity::Driver(7), 60).expect("token should be issued");

        let status =
            status_of(driver_app(service.clone()), get_request(Some(format!("Bearer {admin}"))))
                .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin_app = Router::new()
            .route("/protected", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(service, require_admin));
        let status = status_of(admin_app, get_request(Some(format!("Bearer {driver}")))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn booking_token_is_read_from_cookie() {
        let h = harness(1);
        let grant = h.sessions.create(7, "B1", pickup()).await.expect("create");
        let app = Router::new()
            .route(
                "/protected",
                get(|Extension(booking): Extension<AuthenticatedBooking>| async move {
                    booking.session.booking_id
                }),
            )
            .layer(middleware::from_fn_with_state(
                BookingTokenGate { sessions: h.sessions.clone(), check_remote: true },
                require_booking_token,
            ));

        let request = Request::builder()
            .uri("/protected")
            .header(COOKIE, format!("theme=dark; booking_token={}", grant.token.token))
            .body(Body::empty())
            .expect("request should build");
        assert_eq!(status_of(app.clone(), request).await, StatusCode::OK);

        let status = status_of(app, get_request(None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn cookie_lookup_ignores_other_cookies() {
        assert_eq!(extract_cookie("a=1; booking_token=xyz; b=2", "booking_token"), Some("xyz"));
        assert_eq!(extract_cookie("booking_token=", "booking_token"), None);
        assert_eq!(extract_cookie("other_booking_token=1", "booking_token"), None);
    }
}
