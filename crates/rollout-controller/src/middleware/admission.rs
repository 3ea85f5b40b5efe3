//! Admission middleware.
//!
//! Counts every webhook request against the caller's fixed window before
//! anything else runs, including authentication, so unauthenticated floods
//! are throttled too. The caller identity is the TCP peer IP address.

use crate::errors::RcError;
use crate::observability::metrics::record_admission_denied;
use crate::services::admission_limiter::AdmissionLimiter;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;

/// Reject the request with 429 once the caller exceeds its limit.
#[instrument(skip_all, name = "rc.middleware.admission")]
pub async fn admit_request(
    State(limiter): State<Arc<AdmissionLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, RcError> {
    let identity = addr.ip().to_string();

    if !limiter.allow(&identity) {
        tracing::debug!(
            target: "rc.middleware.admission",
            identity = %identity,
            "Request denied by admission limiter"
        );
        record_admission_denied();
        return Err(RcError::RateLimitExceeded);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::connect_info::MockConnectInfo,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    fn test_app(limiter: Arc<AdmissionLimiter>, peer: [u8; 4]) -> Router {
        Router::new()
            .route("/update", post(|| async { "OK" }))
            .route_layer(middleware::from_fn_with_state(limiter, admit_request))
            .layer(MockConnectInfo(SocketAddr::from((peer, 40000))))
    }

    fn request() -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/update")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_fourth_request_is_rate_limited() {
        let limiter = Arc::new(AdmissionLimiter::new(3));
        let app = test_app(limiter, [10, 0, 0, 1]);

        for _ in 0..3 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_callers_are_limited_separately() {
        let limiter = Arc::new(AdmissionLimiter::new(1));

        let first = test_app(limiter.clone(), [10, 0, 0, 1]);
        let second = test_app(limiter.clone(), [10, 0, 0, 2]);

        assert_eq!(
            first.clone().oneshot(request()).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            first.oneshot(request()).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            second.oneshot(request()).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(limiter.len(), 2);
    }
}
