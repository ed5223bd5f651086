// Request input validation.
//
// - `ValidatedJson<T>` extractor: content-type check + serde with
//   structured `RelayError` rejections.
// - Size limit for producer WebSocket frames.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::{ErrorCode, RelayError};

/// Maximum producer WebSocket frame payload in bytes (16 KiB). A location
/// update is well under 1 KiB.
pub const MAX_WS_FRAME_BYTES: usize = 16 * 1024;

/// Maximum REST request body in bytes (1 MiB).
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

/// A JSON body extractor that returns structured `RelayError` on failure.
///
/// Use this instead of `axum::Json<T>` in handlers so a bad body yields
/// `VALIDATION_FAILED` (or `UNSUPPORTED_MEDIA_TYPE`) instead of Axum's
/// plain-text rejections.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (code, message, details) = classify_json_rejection(&rejection);
                Err(RelayError::new(code, message).with_details(details).into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (ErrorCode, String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => (
            ErrorCode::ValidationFailed,
            format!("invalid JSON payload: {e}"),
            serde_json::json!({ "kind": "data_error" }),
        ),
        JsonRejection::JsonSyntaxError(e) => (
            ErrorCode::ValidationFailed,
            format!("malformed JSON: {e}"),
            serde_json::json!({ "kind": "syntax_error" }),
        ),
        JsonRejection::MissingJsonContentType(_) => (
            ErrorCode::UnsupportedMediaType,
            "expected Content-Type: application/json".to_string(),
            serde_json::json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) => (
            ErrorCode::ValidationFailed,
            format!("request body error: {e}"),
            serde_json::json!({ "kind": "body_error" }),
        ),
        other => (
            ErrorCode::ValidationFailed,
            format!("request body error: {other}"),
            serde_json::json!({ "kind": "unknown" }),
        ),
    }
}

/// Check if a producer frame exceeds the size limit.
/// Returns an error message suitable for sending back as a WS close reason.
pub fn check_ws_frame_size(payload: &[u8]) -> Result<(), String> {
    if payload.len() > MAX_WS_FRAME_BYTES {
        Err(format!(
            "frame size {} bytes exceeds limit of {} bytes",
            payload.len(),
            MAX_WS_FRAME_BYTES
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::post,
        Router,
    };
    use serde::Deserialize;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize)]
    struct CreatePayload {
        booking_id: String,
    }

    async fn echo_handler(
        ValidatedJson(payload): ValidatedJson<CreatePayload>,
    ) -> impl IntoResponse {
        (StatusCode::OK, payload.booking_id)
    }

    async fn send(content_type: Option<&str>, body: &'static str) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(Method::POST).uri("/test");
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        let response = Router::new()
            .route("/test", post(echo_handler))
            .oneshot(builder.body(Body::from(body)).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, body.to_vec())
    }

    fn error_body(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).expect("error body should be JSON")
    }

    #[tokio::test]
    async fn validated_json_accepts_valid_payload() {
        let (status, body) = send(Some("application/json"), r#"{"booking_id":"B1"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"B1");
    }

    #[tokio::test]
    async fn missing_content_type_is_unsupported_media_type() {
        let (status, body) = send(None, r#"{"booking_id":"B1"}"#).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let parsed = error_body(&body);
        assert_eq!(parsed["error"]["code"], "UNSUPPORTED_MEDIA_TYPE");
        assert_eq!(parsed["error"]["details"]["kind"], "missing_content_type");
    }

    #[tokio::test]
    async fn validated_json_rejects_malformed_json() {
        let (status, body) = send(Some("application/json"), "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let parsed = error_body(&body);
        assert_eq!(parsed["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(parsed["error"]["details"]["kind"], "syntax_error");
    }

    #[tokio::test]
    async fn validated_json_rejects_missing_field() {
        let (status, body) = send(Some("application/json"), r#"{"driver": 42}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_body(&body)["error"]["details"]["kind"], "data_error");
    }

    #[test]
    fn ws_frame_size_limit() {
        assert!(check_ws_frame_size(&[]).is_ok());
        assert!(check_ws_frame_size(&vec![0u8; MAX_WS_FRAME_BYTES]).is_ok());
        let err = check_ws_frame_size(&vec![0u8; MAX_WS_FRAME_BYTES + 1]).unwrap_err();
        assert!(err.contains("exceeds limit"));
    }
}
