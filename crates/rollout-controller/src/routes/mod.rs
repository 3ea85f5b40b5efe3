//! HTTP routes for the Rollout Controller.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::{admit_request, http_metrics_middleware, require_webhook_auth, AuthState};
use crate::services::admission_limiter::AdmissionLimiter;
use crate::services::credential_rotator::CredentialRotator;
use crate::services::rollout_engine::RolloutEngine;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Rollout engine owning the tracked image table.
    pub engine: Arc<RolloutEngine>,

    /// Webhook key validation and rotation.
    pub rotator: Arc<CredentialRotator>,

    /// Per-caller admission limiter.
    pub limiter: Arc<AdmissionLimiter>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/update` - Registry push webhook (admission limited, then bearer auth)
/// - `/health` - Liveness probe - public
/// - `/metrics` - Prometheus metrics endpoint - public
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let auth_state = AuthState {
        rotator: state.rotator.clone(),
    };

    // Webhook route. Route layers run bottom-to-top: admission first, so
    // every request counts against the caller even if its key is wrong.
    let webhook_routes = Router::new()
        .route("/update", post(handlers::handle_update))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            require_webhook_auth,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            admit_request,
        ))
        .with_state(state);

    let public_routes = Router::new().route("/health", get(handlers::health_check));

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    webhook_routes
        .merge(public_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}
