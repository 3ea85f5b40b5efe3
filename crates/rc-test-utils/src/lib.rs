//! # RC Test Utilities
//!
//! Shared test utilities for the Rollout Controller.
//!
//! This crate provides:
//! - Server test harness (`TestRolloutServer` for E2E tests)
//! - Update event fixtures (`fixtures`)
//!
//! The harness wires the real router to in-memory collaborators, so no
//! Docker daemon or cloud account is needed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<()> {
//!     let server = TestRolloutServer::spawn().await?;
//!     let client = reqwest::Client::new();
//!
//!     let response = client
//!         .post(format!("{}/update", server.url()))
//!         .bearer_auth(server.webhook_key())
//!         .json(&push_event("app", "prod-1.2.3"))
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
