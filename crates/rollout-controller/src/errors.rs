//! Rollout Controller HTTP error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl.
//! Messages returned for server-side failures are generic; the underlying
//! cause is logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error returned by HTTP handlers and middleware.
///
/// Maps to HTTP status codes:
/// - BadRequest: 400 Bad Request
/// - InvalidToken: 401 Unauthorized
/// - RateLimitExceeded: 429 Too Many Requests
/// - Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum RcError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Internal error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for RcError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            RcError::BadRequest(reason) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.clone()),
            RcError::InvalidToken(reason) => {
                (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", reason.clone())
            }
            RcError::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "Too many requests. Please try again later.".to_string(),
            ),
            RcError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) =
                "Bearer realm=\"rollout-controller\", error=\"invalid_token\"".parse()
            {
                response.headers_mut().insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
