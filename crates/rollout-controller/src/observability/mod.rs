//! Observability for the Rollout Controller.
//!
//! Metric definitions and recording helpers. Tracing is configured in `main`.

pub mod metrics;
