//! Repository layer for the Rollout Controller.
//!
//! State is in memory only and rebuilt from the container runtime at startup.

pub mod rollout_table;

pub use rollout_table::{RolloutStatus, RolloutTable, TrackedImage};
