use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    SessionConflict,
    PartitionsBusy,
    UnsupportedMediaType,
    ViewerLimitReached,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::SessionConflict => "SESSION_CONFLICT",
            Self::PartitionsBusy => "PARTITIONS_BUSY",
            Self::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            Self::ViewerLimitReached => "VIEWER_LIMIT_REACHED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionConflict => StatusCode::CONFLICT,
            Self::PartitionsBusy => StatusCode::CONFLICT,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ViewerLimitReached => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::PartitionsBusy | Self::ViewerLimitReached | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "you are not authorized to perform this operation",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::SessionConflict => "booking is already active under another session",
            Self::PartitionsBusy => "server is busy right now, please try again later",
            Self::UnsupportedMediaType => "request body is not supported",
            Self::ViewerLimitReached => "maximum number of viewers reached for this booking",
            Self::InternalError => "something went wrong, please try again later",
        }
    }
}

/// Failure of a core session or streaming operation.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No partition is free, or the allocator lock could not be taken in time.
    #[error("no partition is available right now")]
    Busy,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("partition {partition} already has {connections} viewers")]
    ViewerLimitReached { partition: u32, connections: i64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::PartitionsBusy,
            Self::Conflict(_) => ErrorCode::SessionConflict,
            Self::Unauthorized(_) => ErrorCode::AuthInvalidToken,
            Self::BadRequest(_) => ErrorCode::ValidationFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::ViewerLimitReached { .. } => ErrorCode::ViewerLimitReached,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<StreamError> for RelayError {
    fn from(error: StreamError) -> Self {
        let code = error.code();
        match error {
            StreamError::Internal(source) => {
                error!(error = ?source, "stream operation failed");
                RelayError::from_code(code)
            }
            StreamError::Busy => RelayError::from_code(code),
            StreamError::ViewerLimitReached { partition, connections } => {
                RelayError::from_code(code)
                    .with_details(json!({ "partition": partition, "connections": connections }))
            }
            other => RelayError::new(code, other.to_string()),
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        RelayError::from(self).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
