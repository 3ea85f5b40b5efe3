//! Webhook authentication middleware.
//!
//! Extracts the Bearer token from the Authorization header and checks it
//! against the credential rotator's current and previous keys.

use crate::errors::RcError;
use crate::observability::metrics::record_auth_failure;
use crate::services::credential_rotator::CredentialRotator;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::instrument;

/// State for the authentication middleware.
#[derive(Clone)]
pub struct AuthState {
    pub rotator: Arc<CredentialRotator>,
}

/// Reject requests without a valid webhook key.
///
/// # Authorization Header Format
///
/// ```text
/// Authorization: Bearer <key>
/// ```
///
/// # Response
///
/// - 401 Unauthorized with a WWW-Authenticate header if the key is missing or invalid
/// - Otherwise continues to the next handler
#[instrument(skip_all, name = "rc.middleware.auth")]
pub async fn require_webhook_auth(
    State(state): State<AuthState>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, RcError> {
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!(target: "rc.middleware.auth", "Missing Authorization header");
            record_auth_failure("missing_header");
            RcError::InvalidToken("Missing Authorization header".to_string())
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        tracing::debug!(target: "rc.middleware.auth", "Invalid Authorization header format");
        record_auth_failure("malformed_header");
        RcError::InvalidToken("Invalid Authorization header format".to_string())
    })?;

    if !state.rotator.validate(token.trim()) {
        tracing::debug!(target: "rc.middleware.auth", "Webhook key rejected");
        record_auth_failure("invalid_token");
        return Err(RcError::InvalidToken("Invalid webhook key".to_string()));
    }

    Ok(next.run(req).await)
}
