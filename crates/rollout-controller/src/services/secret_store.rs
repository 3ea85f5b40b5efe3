//! Secret store collaborator.
//!
//! Holds the persisted copy of the webhook key. `AwsSecretStore` talks to
//! AWS Secrets Manager; `mock::MockSecretStore` keeps secrets in memory.

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from the secret store.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("Failed to read secret: {0}")]
    Read(String),

    #[error("Secret has no string value")]
    Empty,

    #[error("Failed to write secret: {0}")]
    Write(String),
}

/// Read and write access to named JSON secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the JSON string stored under `name`.
    async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError>;

    /// Replace the JSON string stored under `name`.
    async fn update_secret(&self, name: &str, blob: &str) -> Result<(), SecretStoreError>;
}

/// AWS Secrets Manager implementation of `SecretStore`.
#[derive(Clone)]
pub struct AwsSecretStore {
    client: SecretsManagerClient,
}

impl AwsSecretStore {
    pub fn new(client: SecretsManagerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    #[instrument(skip(self), name = "rc.secret_store.get")]
    async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| SecretStoreError::Read(DisplayErrorContext(&e).to_string()))?;

        let value = output.secret_string().ok_or(SecretStoreError::Empty)?;
        debug!(target: "rc.secret_store", "Secret fetched");
        Ok(value.to_string())
    }

    #[instrument(skip(self, blob), name = "rc.secret_store.update")]
    async fn update_secret(&self, name: &str, blob: &str) -> Result<(), SecretStoreError> {
        self.client
            .update_secret()
            .secret_id(name)
            .secret_string(blob)
            .send()
            .await
            .map_err(|e| SecretStoreError::Write(DisplayErrorContext(&e).to_string()))?;

        debug!(target: "rc.secret_store", "Secret updated");
        Ok(())
    }
}

/// Mock secret store for testing.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// In-memory secret store with injectable failures.
    #[derive(Default)]
    pub struct MockSecretStore {
        secrets: Mutex<HashMap<String, String>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        update_count: AtomicUsize,
    }

    impl MockSecretStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a store holding `{"ecr-webhook-secret": key}` under `name`.
        pub fn with_webhook_key(name: &str, key: &str) -> Self {
            let store = Self::default();
            store.put(
                name,
                &serde_json::json!({ "ecr-webhook-secret": key }).to_string(),
            );
            store
        }

        /// Store a raw value under `name`.
        pub fn put(&self, name: &str, blob: &str) {
            self.secrets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), blob.to_string());
        }

        /// Current raw value under `name`.
        pub fn stored(&self, name: &str) -> Option<String> {
            self.secrets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
        }

        pub fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Number of `update_secret` calls, including failed ones.
        pub fn update_count(&self) -> usize {
            self.update_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SecretStore for MockSecretStore {
        async fn get_secret(&self, name: &str) -> Result<String, SecretStoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(SecretStoreError::Read("mock read failure".to_string()));
            }
            self.stored(name).ok_or(SecretStoreError::Empty)
        }

        async fn update_secret(&self, name: &str, blob: &str) -> Result<(), SecretStoreError> {
            self.update_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SecretStoreError::Write("mock write failure".to_string()));
            }
            self.put(name, blob);
            Ok(())
        }
    }
}
