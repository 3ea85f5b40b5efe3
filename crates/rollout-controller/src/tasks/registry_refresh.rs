//! Registry credential refresh task.
//!
//! Refreshes immediately on start, then once per interval. The interval must
//! be shorter than the registry token lifetime. Failures are logged by the
//! refresher and the previously cached blob stays in use.

use crate::services::registry_credentials::RegistryCredentials;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Start the registry credential refresh background task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "rc.task.registry_refresh")]
pub async fn start_registry_refresh(
    credentials: Arc<RegistryCredentials>,
    refresh_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "rc.task.registry_refresh",
        interval_seconds = refresh_interval.as_secs(),
        "Starting registry refresh task"
    );

    let mut interval = tokio::time::interval(refresh_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Errors are logged and counted inside refresh().
                let _ = credentials.refresh().await;
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "rc.task.registry_refresh",
                    "Registry refresh task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "rc.task.registry_refresh", "Registry refresh task stopped");
}
