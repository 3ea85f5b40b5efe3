//! Admission limiter sweep task.
//!
//! Evicts identities whose window has elapsed so the limiter's map does not
//! grow with every address that has ever called.

use crate::observability::metrics::set_rate_limit_entries;
use crate::services::admission_limiter::AdmissionLimiter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Start the admission limiter sweep background task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "rc.task.rate_limit_sweep")]
pub async fn start_rate_limit_sweep(
    limiter: Arc<AdmissionLimiter>,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "rc.task.rate_limit_sweep",
        interval_seconds = sweep_interval.as_secs(),
        "Starting rate limit sweep task"
    );

    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = limiter.evict_stale(Instant::now());
                let remaining = limiter.len();
                set_rate_limit_entries(remaining);
                if evicted > 0 {
                    debug!(
                        target: "rc.task.rate_limit_sweep",
                        evicted = evicted,
                        remaining = remaining,
                        "Evicted stale rate limit entries"
                    );
                }
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "rc.task.rate_limit_sweep",
                    "Rate limit sweep task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "rc.task.rate_limit_sweep", "Rate limit sweep task stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::admission_limiter::WINDOW;

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries() {
        let limiter = Arc::new(AdmissionLimiter::new(3));
        // Window already elapsed relative to the sweep's clock reading.
        let past = Instant::now()
            .checked_sub(WINDOW + Duration::from_secs(5))
            .unwrap();
        limiter.allow_at("10.0.0.1", past);
        limiter.allow("10.0.0.2");

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(start_rate_limit_sweep(
            limiter.clone(),
            Duration::from_secs(300),
            cancel_token.clone(),
        ));

        // The first tick fires immediately.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(limiter.len(), 1);

        cancel_token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_task() {
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        start_rate_limit_sweep(
            Arc::new(AdmissionLimiter::new(3)),
            Duration::from_secs(300),
            cancel_token,
        )
        .await;
    }
}
