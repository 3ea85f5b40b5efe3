//! Background tasks for the Rollout Controller.
//!
//! Every task loops on a fixed interval and exits when its cancellation
//! token fires.
//!
//! # Tasks
//!
//! - `key_rotation` - Rotates the webhook key
//! - `registry_refresh` - Refreshes the registry login blob
//! - `rate_limit_sweep` - Evicts expired admission limiter entries

pub mod key_rotation;
pub mod rate_limit_sweep;
pub mod registry_refresh;

pub use key_rotation::start_key_rotation;
pub use rate_limit_sweep::start_rate_limit_sweep;
pub use registry_refresh::start_registry_refresh;
