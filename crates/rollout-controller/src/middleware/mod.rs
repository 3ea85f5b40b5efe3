//! Middleware for the Rollout Controller.
//!
//! # Components
//!
//! - `admission` - Per-caller admission limiter in front of the webhook
//! - `auth` - Webhook bearer token validation
//! - `http_metrics` - HTTP request metrics for every response

pub mod admission;
pub mod auth;
pub mod http_metrics;

pub use admission::admit_request;
pub use auth::{require_webhook_auth, AuthState};
pub use http_metrics::http_metrics_middleware;
