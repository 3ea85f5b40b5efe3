//! Rollout Controller
//!
//! Entry point. Keeps tracked containers on the newest image pushed to the
//! registry for their tag prefix.

use aws_config::{BehaviorVersion, Region};
use rollout_controller::config::{Config, LogFormat, WatchedImagesConfig};
use rollout_controller::observability::metrics::init_metrics_recorder;
use rollout_controller::routes::{self, AppState};
use rollout_controller::services::{
    AdmissionLimiter, AwsSecretStore, ContainerRuntime, CredentialRotator, DockerRuntime,
    EcrRegistryIdentity, RegistryCredentials, RegistryIdentity, RolloutEngine, SecretStore,
};
use rollout_controller::tasks;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration comes first so the log format is known
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Text);
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_tracing(config.log_format);

    info!("Starting Rollout Controller");

    let watched = WatchedImagesConfig::load(&config.watched_images_path).map_err(|e| {
        error!("Failed to load tracked images: {}", e);
        e
    })?;
    let secret_name = config.resolve_secret_name(&watched).map_err(|e| {
        error!("Failed to resolve secret name: {}", e);
        e
    })?;

    info!(
        region = %config.region,
        bind_address = %config.bind_address,
        tracked_images = watched.watched_images.len(),
        rate_limit_rpm = config.rate_limit_rpm,
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    // External collaborators
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .load()
        .await;
    let secret_store: Arc<dyn SecretStore> = Arc::new(AwsSecretStore::new(
        aws_sdk_secretsmanager::Client::new(&aws_config),
    ));
    let registry_identity: Arc<dyn RegistryIdentity> = Arc::new(EcrRegistryIdentity::new(
        aws_sdk_ecr::Client::new(&aws_config),
    ));

    info!("Connecting to container runtime...");
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().map_err(|e| {
        error!("Failed to connect to container runtime: {}", e);
        e
    })?);

    let credentials = Arc::new(RegistryCredentials::new(registry_identity));

    let engine = Arc::new(
        RolloutEngine::initialize(
            &watched.watched_images,
            runtime,
            credentials.clone(),
            Duration::from_secs(config.runtime_call_timeout_seconds),
        )
        .await
        .map_err(|e| {
            error!("Failed to reconcile with container runtime: {}", e);
            e
        })?,
    );

    let rotator = Arc::new(
        CredentialRotator::load(
            secret_store,
            &secret_name,
            Duration::from_secs(config.key_grace_period_seconds),
        )
        .await
        .map_err(|e| {
            error!("Failed to load webhook key: {}", e);
            e
        })?,
    );

    let limiter = Arc::new(AdmissionLimiter::new(config.rate_limit_rpm));

    // Background tasks share one cancellation token
    let cancel_token = CancellationToken::new();
    let task_handles = vec![
        tokio::spawn(tasks::start_registry_refresh(
            credentials,
            Duration::from_secs(config.registry_refresh_interval_seconds),
            cancel_token.clone(),
        )),
        tokio::spawn(tasks::start_key_rotation(
            rotator.clone(),
            Duration::from_secs(config.key_rotation_interval_seconds),
            cancel_token.clone(),
        )),
        tokio::spawn(tasks::start_rate_limit_sweep(
            limiter.clone(),
            Duration::from_secs(config.rate_limit_sweep_interval_seconds),
            cancel_token.clone(),
        )),
    ];

    let bind_address = config.bind_address.clone();
    let drain_period = Duration::from_secs(config.drain_seconds);

    let state = Arc::new(AppState {
        config,
        engine,
        rotator,
        limiter,
    });

    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Rollout Controller listening on {}", addr);

    // Peer addresses are needed by the admission limiter
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(drain_period))
    .await?;

    cancel_token.cancel();
    for handle in task_handles {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Rollout Controller shutdown complete");

    Ok(())
}

/// Install the global tracing subscriber.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rollout_controller=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and the drain period is complete.
async fn shutdown_signal(drain_period: Duration) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    if drain_period.is_zero() {
        info!("Skipping drain period (DRAIN_SECONDS=0)");
    } else {
        warn!("Draining connections for {} seconds...", drain_period.as_secs());
        tokio::time::sleep(drain_period).await;
        info!("Drain period complete");
    }
}
