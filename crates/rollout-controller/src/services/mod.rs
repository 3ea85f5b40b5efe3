//! Service layer for the Rollout Controller.
//!
//! # Components
//!
//! - `admission_limiter` - Fixed-window per-caller request counter
//! - `container_runtime` - Container runtime seam (Docker via bollard)
//! - `credential_rotator` - Webhook key validation and rotation
//! - `registry_credentials` - Registry login blob cache (ECR)
//! - `rollout_engine` - Update event to pull-and-swap decision
//! - `secret_store` - Secret store seam (AWS Secrets Manager)

pub mod admission_limiter;
pub mod container_runtime;
pub mod credential_rotator;
pub mod registry_credentials;
pub mod rollout_engine;
pub mod secret_store;

pub use admission_limiter::AdmissionLimiter;
pub use container_runtime::{ContainerRuntime, DockerRuntime};
pub use credential_rotator::CredentialRotator;
pub use registry_credentials::{EcrRegistryIdentity, RegistryCredentials, RegistryIdentity};
pub use rollout_engine::{RolloutEngine, RolloutError, RolloutOutcome};
pub use secret_store::{AwsSecretStore, SecretStore};
