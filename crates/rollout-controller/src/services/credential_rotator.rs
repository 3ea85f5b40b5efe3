//! Webhook credential rotator.
//!
//! Holds the shared key callers present as `Authorization: Bearer <key>`.
//! The key lives in the secret store as `{"ecr-webhook-secret": "<key>"}`
//! and is rotated on a timer. After a rotation the previous key stays valid
//! for a grace window so callers holding the old value are not cut off.
//!
//! # Rotation
//!
//! Rotations are serialized by an async mutex. The new key is persisted
//! first and only then swapped into memory, so a failed write leaves both
//! the active and previous keys exactly as they were. A key that is active
//! in memory is always the one a restarting replica would fetch.

use crate::observability::metrics::record_key_rotation;
use crate::services::secret_store::{SecretStore, SecretStoreError};
use base64::{engine::general_purpose, Engine as _};
use common::secret::{tokens_match, ExposeSecret, SecretString};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// JSON field holding the key inside the stored secret.
pub const WEBHOOK_SECRET_FIELD: &str = "ecr-webhook-secret";

/// Random bytes per generated key.
const KEY_BYTES: usize = 32;

/// Errors from loading or rotating the webhook key.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to load webhook key: {0}")]
    Load(#[source] SecretStoreError),

    #[error("Stored webhook key is malformed: {0}")]
    Malformed(String),

    #[error("Stored webhook key is empty")]
    EmptyKey,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Failed to persist rotated webhook key: {0}")]
    Persist(#[source] SecretStoreError),
}

#[derive(Deserialize)]
struct StoredWebhookKey {
    #[serde(rename = "ecr-webhook-secret")]
    key: SecretString,
}

/// Current and previous keys.
#[derive(Debug)]
struct CredentialState {
    current_key: SecretString,
    previous_key: Option<SecretString>,
    previous_key_expiry: Option<Instant>,
}

/// Generate a fresh webhook key (32 random bytes, base64 encoded).
#[instrument(skip_all)]
pub fn generate_webhook_key() -> Result<SecretString, CredentialError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; KEY_BYTES];
    rng.fill(&mut bytes).map_err(|e| {
        CredentialError::KeyGeneration(format!("Random bytes generation failed: {}", e))
    })?;
    Ok(SecretString::from(general_purpose::STANDARD.encode(bytes)))
}

/// Validates webhook bearer tokens and rotates the shared key.
pub struct CredentialRotator {
    store: Arc<dyn SecretStore>,
    secret_name: String,
    grace: Duration,
    state: RwLock<CredentialState>,
    rotation: Mutex<()>,
}

impl CredentialRotator {
    /// Fetch the current key from the secret store.
    ///
    /// Runs once at startup; the service must not serve requests without it.
    #[instrument(skip_all, name = "rc.services.credential_load")]
    pub async fn load(
        store: Arc<dyn SecretStore>,
        secret_name: &str,
        grace: Duration,
    ) -> Result<Self, CredentialError> {
        let raw = store
            .get_secret(secret_name)
            .await
            .map_err(CredentialError::Load)?;
        let stored: StoredWebhookKey =
            serde_json::from_str(&raw).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if stored.key.expose_secret().is_empty() {
            return Err(CredentialError::EmptyKey);
        }

        info!(target: "rc.services.credentials", "Webhook key loaded");

        Ok(Self {
            store,
            secret_name: secret_name.to_string(),
            grace,
            state: RwLock::new(CredentialState {
                current_key: stored.key,
                previous_key: None,
                previous_key_expiry: None,
            }),
            rotation: Mutex::new(()),
        })
    }

    /// Check a presented bearer token.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Instant::now())
    }

    /// `validate` with an explicit clock reading.
    ///
    /// True for the current key, or for the previous key while `now` is
    /// before its expiry.
    pub fn validate_at(&self, token: &str, now: Instant) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if tokens_match(token, &state.current_key) {
            return true;
        }

        match (&state.previous_key, state.previous_key_expiry) {
            (Some(previous), Some(expiry)) if now < expiry => tokens_match(token, previous),
            _ => false,
        }
    }

    /// Replace the current key with a freshly generated one.
    ///
    /// On error nothing changes and the error is returned.
    #[instrument(skip_all, name = "rc.services.credential_rotate")]
    pub async fn rotate(&self) -> Result<(), CredentialError> {
        let _rotation = self.rotation.lock().await;

        let new_key = match generate_webhook_key() {
            Ok(key) => key,
            Err(e) => {
                record_key_rotation("error");
                return Err(e);
            }
        };

        let blob = serde_json::json!({ WEBHOOK_SECRET_FIELD: new_key.expose_secret() }).to_string();
        if let Err(e) = self.store.update_secret(&self.secret_name, &blob).await {
            record_key_rotation("error");
            warn!(
                target: "rc.services.credentials",
                error = %e,
                "Webhook key rotation failed, keeping current key"
            );
            return Err(CredentialError::Persist(e));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut state.current_key, new_key);
        state.previous_key = Some(previous);
        state.previous_key_expiry = Some(Instant::now() + self.grace);
        drop(state);

        record_key_rotation("success");
        info!(
            target: "rc.services.credentials",
            grace_seconds = self.grace.as_secs(),
            "Webhook key rotated"
        );
        Ok(())
    }

    /// The key callers should currently present.
    pub fn current_key(&self) -> SecretString {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        SecretString::from(state.current_key.expose_secret())
    }
}
