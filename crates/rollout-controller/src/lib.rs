//! Rollout Controller Library
//!
//! Receives registry push notifications and keeps tracked containers running
//! the newest image for their tag prefix:
//!
//! - Admission limiting per caller address
//! - Webhook bearer authentication with rotating shared keys
//! - Pull-and-swap rollouts serialized per controller instance
//! - Periodic registry credential refresh
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> middleware/*.rs -> handlers/*.rs -> services/*.rs -> repositories/*.rs
//! ```
//!
//! Background loops live in `tasks`.
//!
//! # Modules
//!
//! - `config` - Service configuration from environment and the tracked image file
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Admission, auth and metrics middleware
//! - `models` - Wire types
//! - `observability` - Metrics
//! - `repositories` - In-memory rollout table
//! - `routes` - Axum router setup
//! - `services` - Rollout engine, credential rotator, limiter and collaborators
//! - `tasks` - Background tasks

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod tasks;
