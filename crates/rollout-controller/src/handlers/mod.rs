//! HTTP request handlers for the Rollout Controller.

pub mod health;
pub mod metrics;
pub mod update;

pub use health::health_check;
pub use metrics::metrics_handler;
pub use update::handle_update;
