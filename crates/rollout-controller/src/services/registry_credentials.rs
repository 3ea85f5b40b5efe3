//! Registry credential refresher.
//!
//! Exchanges the process identity for a short-lived registry login token and
//! caches it as the auth blob the container runtime expects for pulls:
//! `base64url(json{"username","password"})`.
//!
//! A failed refresh keeps the previously cached blob. A stale blob that is
//! still inside the token lifetime is preferable to blocking every pull.

use crate::observability::metrics::record_registry_token_refresh;
use async_trait::async_trait;
use aws_sdk_ecr::error::DisplayErrorContext;
use aws_sdk_ecr::Client as EcrClient;
use base64::{engine::general_purpose, Engine as _};
use common::secret::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors from the registry identity or the cached blob.
#[derive(Debug, Error)]
pub enum RegistryAuthError {
    #[error("Failed to fetch registry authorization token: {0}")]
    Fetch(String),

    #[error("Registry returned no authorization data")]
    NoAuthorizationData,

    #[error("Malformed registry authorization token: {0}")]
    MalformedToken(String),

    #[error("Registry credentials not available")]
    NotAvailable,
}

/// Source of registry login tokens.
#[async_trait]
pub trait RegistryIdentity: Send + Sync {
    /// Fetch a login token, encoded as `base64("user:pass")`.
    async fn authorization_token(&self) -> Result<SecretString, RegistryAuthError>;
}

/// ECR implementation of `RegistryIdentity`.
#[derive(Clone)]
pub struct EcrRegistryIdentity {
    client: EcrClient,
}

impl EcrRegistryIdentity {
    pub fn new(client: EcrClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RegistryIdentity for EcrRegistryIdentity {
    #[instrument(skip_all, name = "rc.registry.authorization_token")]
    async fn authorization_token(&self) -> Result<SecretString, RegistryAuthError> {
        let output = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| RegistryAuthError::Fetch(DisplayErrorContext(&e).to_string()))?;

        output
            .authorization_data()
            .first()
            .and_then(|data| data.authorization_token())
            .map(SecretString::from)
            .ok_or(RegistryAuthError::NoAuthorizationData)
    }
}

#[derive(Serialize)]
struct RegistryLogin<'a> {
    username: &'a str,
    password: &'a str,
}

/// Turn a `base64("user:pass")` token into `base64url(json{"username","password"})`.
fn encode_auth_blob(token: &str) -> Result<SecretString, RegistryAuthError> {
    let decoded = general_purpose::STANDARD
        .decode(token)
        .map_err(|e| RegistryAuthError::MalformedToken(format!("not base64: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| RegistryAuthError::MalformedToken("not UTF-8".to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| RegistryAuthError::MalformedToken("missing ':' separator".to_string()))?;

    let json = serde_json::to_vec(&RegistryLogin { username, password })
        .map_err(|e| RegistryAuthError::MalformedToken(e.to_string()))?;

    Ok(SecretString::from(general_purpose::URL_SAFE.encode(json)))
}

/// Cached registry auth blob, refreshed from a `RegistryIdentity`.
pub struct RegistryCredentials {
    identity: Arc<dyn RegistryIdentity>,
    blob: RwLock<Option<SecretString>>,
}

impl RegistryCredentials {
    /// Create an empty cache. `auth_blob` fails until `refresh` succeeds once.
    pub fn new(identity: Arc<dyn RegistryIdentity>) -> Self {
        Self {
            identity,
            blob: RwLock::new(None),
        }
    }

    /// Fetch a fresh token and replace the cached blob.
    ///
    /// On error the cached blob is left untouched.
    #[instrument(skip_all, name = "rc.services.registry_refresh")]
    pub async fn refresh(&self) -> Result<(), RegistryAuthError> {
        let start = Instant::now();
        let result = match self.identity.authorization_token().await {
            Ok(token) => encode_auth_blob(token.expose_secret()),
            Err(e) => Err(e),
        };

        match result {
            Ok(blob) => {
                *self.blob.write().unwrap_or_else(PoisonError::into_inner) = Some(blob);
                record_registry_token_refresh("success", start.elapsed());
                info!(target: "rc.services.registry", "Registry credentials refreshed");
                Ok(())
            }
            Err(e) => {
                record_registry_token_refresh("error", start.elapsed());
                warn!(
                    target: "rc.services.registry",
                    error = %e,
                    has_cached = self.has_blob(),
                    "Registry credential refresh failed"
                );
                Err(e)
            }
        }
    }

    /// The cached auth blob.
    pub fn auth_blob(&self) -> Result<SecretString, RegistryAuthError> {
        self.blob
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|blob| SecretString::from(blob.expose_secret()))
            .ok_or(RegistryAuthError::NotAvailable)
    }

    pub fn has_blob(&self) -> bool {
        self.blob
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Mock registry identity for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hands out a fixed `user:pass` token and counts calls.
    pub struct MockRegistryIdentity {
        credentials: Mutex<(String, String)>,
        fail: AtomicBool,
        call_count: AtomicUsize,
    }

    impl MockRegistryIdentity {
        pub fn new(username: &str, password: &str) -> Self {
            Self {
                credentials: Mutex::new((username.to_string(), password.to_string())),
                fail: AtomicBool::new(false),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Change the credentials handed out by subsequent calls.
        pub fn set_credentials(&self, username: &str, password: &str) {
            *self
                .credentials
                .lock()
                .unwrap_or_else(PoisonError::into_inner) =
                (username.to_string(), password.to_string());
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryIdentity for MockRegistryIdentity {
        async fn authorization_token(&self) -> Result<SecretString, RegistryAuthError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryAuthError::Fetch("mock failure".to_string()));
            }
            let (username, password) = self
                .credentials
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            Ok(SecretString::from(
                general_purpose::STANDARD.encode(format!("{}:{}", username, password)),
            ))
        }
    }
}
