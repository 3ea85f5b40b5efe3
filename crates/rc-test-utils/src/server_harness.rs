//! Test server harness for E2E testing
//!
//! Provides `TestRolloutServer` for spawning real Rollout Controller server
//! instances in tests, backed by in-memory collaborators.

use crate::fixtures::default_watched_image;
use common::secret::ExposeSecret;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rollout_controller::config::{Config, WatchedImage};
use rollout_controller::observability::metrics::init_metrics_recorder;
use rollout_controller::routes::{self, AppState};
use rollout_controller::services::admission_limiter::AdmissionLimiter;
use rollout_controller::services::container_runtime::mock::MockContainerRuntime;
use rollout_controller::services::container_runtime::ContainerSummary;
use rollout_controller::services::credential_rotator::CredentialRotator;
use rollout_controller::services::registry_credentials::mock::MockRegistryIdentity;
use rollout_controller::services::registry_credentials::RegistryCredentials;
use rollout_controller::services::rollout_engine::RolloutEngine;
use rollout_controller::services::secret_store::mock::MockSecretStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Secret store entry the test server reads its webhook key from.
pub const TEST_SECRET_NAME: &str = "rollout-controller/webhook";

/// Webhook key the test server starts with.
pub const TEST_WEBHOOK_KEY: &str = "test-webhook-key";

/// One recorder per test binary; later servers share its handle.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| match init_metrics_recorder() {
            Ok(handle) => handle,
            // Another harness in this process already installed a recorder
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        })
        .clone()
}

/// Settings for a spawned test server.
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    /// Tracked images.
    pub watched_images: Vec<WatchedImage>,
    /// Containers the runtime reports at startup.
    pub existing_containers: Vec<ContainerSummary>,
    /// Admission limit per caller per minute.
    pub rate_limit_rpm: u32,
    /// Grace window for the previous webhook key.
    pub key_grace_period: Duration,
    /// Whether a registry login blob is cached before serving.
    pub registry_login_ready: bool,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            watched_images: vec![default_watched_image()],
            existing_containers: Vec::new(),
            rate_limit_rpm: 30,
            key_grace_period: Duration::from_secs(900),
            registry_login_ready: true,
        }
    }
}

/// Test harness for spawning the Rollout Controller in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_e2e() -> Result<()> {
///     let server = TestRolloutServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRolloutServer {
    addr: SocketAddr,
    runtime: Arc<MockContainerRuntime>,
    store: Arc<MockSecretStore>,
    engine: Arc<RolloutEngine>,
    rotator: Arc<CredentialRotator>,
    _handle: JoinHandle<()>,
}

impl TestRolloutServer {
    /// Spawn a server tracking the default image with default settings.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(TestServerOptions::default()).await
    }

    /// Spawn a server with custom settings.
    ///
    /// The server will:
    /// - Reconcile the tracked images against `existing_containers`
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn_with(options: TestServerOptions) -> Result<Self, anyhow::Error> {
        let vars = HashMap::from([
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("AWS_REGION".to_string(), "test-region".to_string()),
            ("SECRET_NAME".to_string(), TEST_SECRET_NAME.to_string()),
            (
                "RATE_LIMIT_RPM".to_string(),
                options.rate_limit_rpm.to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let runtime = Arc::new(MockContainerRuntime::with_containers(
            options.existing_containers,
        ));

        let credentials = Arc::new(RegistryCredentials::new(Arc::new(
            MockRegistryIdentity::new("AWS", "registry-password"),
        )));
        if options.registry_login_ready {
            credentials
                .refresh()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to seed registry login: {}", e))?;
        }

        let engine = Arc::new(
            RolloutEngine::initialize(
                &options.watched_images,
                runtime.clone(),
                credentials,
                Duration::from_secs(5),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize rollout engine: {}", e))?,
        );

        let store = Arc::new(MockSecretStore::with_webhook_key(
            TEST_SECRET_NAME,
            TEST_WEBHOOK_KEY,
        ));
        let rotator = Arc::new(
            CredentialRotator::load(store.clone(), TEST_SECRET_NAME, options.key_grace_period)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load webhook key: {}", e))?,
        );

        let state = Arc::new(AppState {
            limiter: Arc::new(AdmissionLimiter::new(config.rate_limit_rpm)),
            config,
            engine: engine.clone(),
            rotator: rotator.clone(),
        });

        let app = routes::build_routes(state, metrics_handle());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            // The admission limiter keys on the peer address
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            runtime,
            store,
            engine,
            rotator,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The mock container runtime, for call assertions and fault injection.
    pub fn runtime(&self) -> &MockContainerRuntime {
        &self.runtime
    }

    /// The mock secret store holding the webhook key.
    pub fn secret_store(&self) -> &MockSecretStore {
        &self.store
    }

    /// The rollout engine, for inspecting the tracked image table.
    pub fn engine(&self) -> &RolloutEngine {
        &self.engine
    }

    /// The webhook credential rotator.
    pub fn rotator(&self) -> &CredentialRotator {
        &self.rotator
    }

    /// The currently active webhook key.
    pub fn webhook_key(&self) -> String {
        self.rotator.current_key().expose_secret().to_string()
    }
}

impl Drop for TestRolloutServer {
    fn drop(&mut self) {
        // Stop the HTTP server task when the test completes
        self._handle.abort();
    }
}
