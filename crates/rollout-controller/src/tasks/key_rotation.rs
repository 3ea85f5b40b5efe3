//! Webhook key rotation task.
//!
//! Rotates the webhook key once per interval. The first rotation happens one
//! full interval after startup; the key loaded at startup is used until then.
//! A failed rotation is logged and retried at the next tick.

use crate::services::credential_rotator::CredentialRotator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Start the key rotation background task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "rc.task.key_rotation")]
pub async fn start_key_rotation(
    rotator: Arc<CredentialRotator>,
    rotation_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "rc.task.key_rotation",
        interval_seconds = rotation_interval.as_secs(),
        "Starting key rotation task"
    );

    let mut interval = interval_at(Instant::now() + rotation_interval, rotation_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = rotator.rotate().await {
                    error!(
                        target: "rc.task.key_rotation",
                        error = %e,
                        "Webhook key rotation failed"
                    );
                }
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "rc.task.key_rotation",
                    "Key rotation task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "rc.task.key_rotation", "Key rotation task stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::secret_store::mock::MockSecretStore;
    use common::secret::ExposeSecret;

    async fn rotator(store: Arc<MockSecretStore>) -> Arc<CredentialRotator> {
        Arc::new(
            CredentialRotator::load(store, "hook", Duration::from_secs(900))
                .await
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_once_per_interval() {
        let store = Arc::new(MockSecretStore::with_webhook_key("hook", "initial"));
        let rotator = rotator(store.clone()).await;
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(start_key_rotation(
            rotator.clone(),
            Duration::from_secs(60),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.update_count(), 0);
        assert_eq!(rotator.current_key().expose_secret(), "initial");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.update_count(), 1);
        assert_ne!(rotator.current_key().expose_secret(), "initial");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.update_count(), 2);

        cancel_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rotation_keeps_task_running() {
        let store = Arc::new(MockSecretStore::with_webhook_key("hook", "initial"));
        store.set_fail_writes(true);
        let rotator = rotator(store.clone()).await;
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(start_key_rotation(
            rotator.clone(),
            Duration::from_secs(60),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.update_count(), 1);
        assert!(rotator.validate("initial"));

        store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.update_count(), 2);
        assert_ne!(rotator.current_key().expose_secret(), "initial");

        cancel_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_task() {
        let store = Arc::new(MockSecretStore::with_webhook_key("hook", "initial"));
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        start_key_rotation(rotator(store.clone()).await, Duration::from_secs(60), cancel_token)
            .await;

        assert_eq!(store.update_count(), 0);
    }
}
