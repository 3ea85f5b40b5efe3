//! Rollout engine.
//!
//! Maps a (repository, tag) update to a tracked slot and swaps the slot's
//! container for one running the new tag.
//!
//! # Serialization
//!
//! One async mutex guards the rollout table for the whole of
//! `handle_update`, runtime calls included. Two events, for the same or
//! different repositories, never interleave. A slow pull therefore delays
//! every other rollout behind it; each runtime call carries its own
//! deadline so a hung call cannot hold the lock forever.
//!
//! # Partial failure
//!
//! The row's `current_tag` / `previous_tag` are updated before any runtime
//! call. If a later step fails the tags stay updated and the row's status
//! becomes `Failed` with the reason, so the inconsistency is visible in
//! `snapshot()` rather than silent. Failures are not retried.

use crate::config::WatchedImage;
use crate::observability::metrics::record_rollout;
use crate::repositories::rollout_table::{
    normalize_repository, RolloutStatus, RolloutTable, TableLookup, TrackedImage,
};
use crate::services::container_runtime::{ContainerRuntime, RuntimeError};
use crate::services::registry_credentials::{RegistryAuthError, RegistryCredentials};
use chrono::Utc;
use common::secret::ExposeSecret;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

/// Errors that abort a rollout.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("registry credentials unavailable: {0}")]
    RegistryAuth(#[from] RegistryAuthError),

    #[error("{operation} failed: {source}")]
    Runtime {
        operation: &'static str,
        source: RuntimeError,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

/// What `handle_update` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Repository is not tracked; nothing happened.
    UnknownRepository,
    /// Repository is tracked but no prefix matches the tag; nothing happened.
    NoMatchingPrefix,
    /// First container started for the slot.
    Deployed { container_id: String },
    /// Previous container stopped and removed, new one started.
    Replaced {
        old_container_id: String,
        container_id: String,
    },
}

impl RolloutOutcome {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            RolloutOutcome::UnknownRepository => "unknown_repository",
            RolloutOutcome::NoMatchingPrefix => "no_matching_prefix",
            RolloutOutcome::Deployed { .. } => "deployed",
            RolloutOutcome::Replaced { .. } => "replaced",
        }
    }
}

/// Drives pull-and-swap rollouts for the tracked images.
pub struct RolloutEngine {
    table: Mutex<RolloutTable>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<RegistryCredentials>,
    call_timeout: Duration,
}

impl RolloutEngine {
    pub fn new(
        table: RolloutTable,
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<RegistryCredentials>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            table: Mutex::new(table),
            runtime,
            credentials,
            call_timeout,
        }
    }

    /// Build the table from configuration and reconcile it against the
    /// containers the runtime already has.
    ///
    /// Failing to list containers is a startup error.
    #[instrument(skip_all, name = "rc.services.rollout_initialize")]
    pub async fn initialize(
        watched: &[WatchedImage],
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<RegistryCredentials>,
        call_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let containers = runtime.list_containers().await?;
        let mut table = RolloutTable::from_watched_images(watched);
        let seeded = table.reconcile(&containers);

        info!(
            target: "rc.services.rollout",
            tracked = table.len(),
            seeded = seeded,
            containers = containers.len(),
            "Rollout table initialized"
        );

        Ok(Self::new(table, runtime, credentials, call_timeout))
    }

    /// Apply an image update event.
    #[instrument(skip(self), name = "rc.services.rollout")]
    pub async fn handle_update(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<RolloutOutcome, RolloutError> {
        let start = Instant::now();
        let mut table = self.table.lock().await;

        let row = match table.find_match_mut(repository, tag) {
            TableLookup::Matched(row) => row,
            TableLookup::UnknownRepository => {
                debug!(
                    target: "rc.services.rollout",
                    repository = %normalize_repository(repository),
                    "Ignoring update for untracked repository"
                );
                record_rollout("unknown_repository", start.elapsed());
                return Ok(RolloutOutcome::UnknownRepository);
            }
            TableLookup::NoMatchingPrefix => {
                debug!(
                    target: "rc.services.rollout",
                    repository = %normalize_repository(repository),
                    tag = %tag,
                    "Ignoring update with no matching tag prefix"
                );
                record_rollout("no_matching_prefix", start.elapsed());
                return Ok(RolloutOutcome::NoMatchingPrefix);
            }
        };

        row.previous_tag = std::mem::replace(&mut row.current_tag, tag.to_string());
        row.last_updated = Some(Utc::now());
        row.status = RolloutStatus::Pending;

        let result = self.swap_container(row, tag).await;

        match &result {
            Ok(outcome) => {
                row.status = RolloutStatus::Running;
                record_rollout(outcome.label(), start.elapsed());
                info!(
                    target: "rc.services.rollout",
                    repository = %row.repository_name,
                    tag = %tag,
                    previous_tag = %row.previous_tag,
                    container_id = %row.container_id,
                    outcome = outcome.label(),
                    "Rollout complete"
                );
            }
            Err(e) => {
                row.status = RolloutStatus::Failed {
                    reason: e.to_string(),
                };
                record_rollout("failed", start.elapsed());
                error!(
                    target: "rc.services.rollout",
                    repository = %row.repository_name,
                    tag = %tag,
                    error = %e,
                    "Rollout aborted"
                );
            }
        }

        result
    }

    /// Stop and remove the slot's container if it has one, then pull,
    /// create and start `tag`.
    ///
    /// Registry credentials are fetched first so no container is torn down
    /// that could not be replaced. Once the old container is removed the
    /// row no longer owns it, and a created container is owned even if it
    /// then fails to start.
    async fn swap_container(
        &self,
        row: &mut TrackedImage,
        tag: &str,
    ) -> Result<RolloutOutcome, RolloutError> {
        let reference = row.image_reference(tag);
        let auth_blob = self.credentials.auth_blob()?;

        let old_container_id = if row.has_container() {
            let old = row.container_id.clone();
            self.call("stop", self.runtime.stop_container(&old)).await?;
            self.call("remove", self.runtime.remove_container(&old)).await?;
            row.container_id.clear();
            Some(old)
        } else {
            None
        };

        self.call("pull", self.runtime.pull_image(&reference, auth_blob.expose_secret())).await?;
        let container_id = self
            .call("create", self.runtime.create_container(&reference))
            .await?;
        row.container_id = container_id.clone();
        self.call("start", self.runtime.start_container(&container_id)).await?;

        Ok(match old_container_id {
            Some(old_container_id) => RolloutOutcome::Replaced {
                old_container_id,
                container_id,
            },
            None => RolloutOutcome::Deployed { container_id },
        })
    }

    /// Run one runtime call under the per-call deadline.
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RolloutError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(RolloutError::Runtime { operation, source }),
            Err(_) => Err(RolloutError::Timeout { operation }),
        }
    }

    /// Stop tracking a repository. Its containers are left running.
    pub async fn untrack_repository(&self, repository: &str) -> bool {
        let removed = self.table.lock().await.remove_repository(repository);
        if let Some(rows) = &removed {
            info!(
                target: "rc.services.rollout",
                repository = %normalize_repository(repository),
                rows = rows.len(),
                "Repository untracked"
            );
        }
        removed.is_some()
    }

    /// Copy of every tracked row.
    pub async fn snapshot(&self) -> Vec<TrackedImage> {
        self.table.lock().await.rows()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::container_runtime::mock::{MockContainerRuntime, RuntimeCall};
    use crate::services::container_runtime::ContainerSummary;
    use crate::services::registry_credentials::mock::MockRegistryIdentity;

    const URI: &str = "acct.region.amazonaws.com/";

    fn watched(name: &str, prefix: &str) -> WatchedImage {
        WatchedImage {
            repository_name: name.to_string(),
            repository_uri: URI.to_string(),
            image_tag_prefix: prefix.to_string(),
        }
    }

    async fn ready_credentials() -> Arc<RegistryCredentials> {
        let credentials = Arc::new(RegistryCredentials::new(Arc::new(
            MockRegistryIdentity::new("AWS", "s3cr3t"),
        )));
        credentials.refresh().await.unwrap();
        credentials
    }

    async fn engine_with(
        watched: &[WatchedImage],
        runtime: Arc<MockContainerRuntime>,
    ) -> RolloutEngine {
        RolloutEngine::initialize(
            watched,
            runtime,
            ready_credentials().await,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    fn row<'a>(rows: &'a [TrackedImage], prefix: &str) -> &'a TrackedImage {
        rows.iter().find(|r| r.tag_prefix == prefix).unwrap()
    }

    #[tokio::test]
    async fn test_first_deployment_pulls_creates_and_starts() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;

        let outcome = engine.handle_update("app", "prod-1.2.3").await.unwrap();

        assert_eq!(
            outcome,
            RolloutOutcome::Deployed {
                container_id: "container-1".to_string()
            }
        );
        assert_eq!(runtime.operations(), vec!["list", "pull", "create", "start"]);
        match runtime.calls().get(1).unwrap() {
            RuntimeCall::Pull { reference, .. } => {
                assert_eq!(reference, "acct.region.amazonaws.com/app:prod-1.2.3")
            }
            other => unreachable!("unexpected call {:?}", other),
        }

        let rows = engine.snapshot().await;
        let slot = row(&rows, "prod");
        assert_eq!(slot.current_tag, "prod-1.2.3");
        assert_eq!(slot.previous_tag, "");
        assert_eq!(slot.container_id, "container-1");
        assert_eq!(slot.status, RolloutStatus::Running);
        assert!(slot.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_replacement_stops_and_removes_old_container() {
        let runtime = Arc::new(MockContainerRuntime::with_containers(vec![ContainerSummary {
            id: "old-id".to_string(),
            image_ref: "acct.region.amazonaws.com/app:prod-1.0.0".to_string(),
            state: "running".to_string(),
        }]));
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;

        let outcome = engine.handle_update("app", "prod-1.1.0").await.unwrap();

        assert_eq!(
            outcome,
            RolloutOutcome::Replaced {
                old_container_id: "old-id".to_string(),
                container_id: "container-1".to_string()
            }
        );
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::List,
                RuntimeCall::Stop {
                    id: "old-id".to_string()
                },
                RuntimeCall::Remove {
                    id: "old-id".to_string()
                },
                RuntimeCall::Pull {
                    reference: "acct.region.amazonaws.com/app:prod-1.1.0".to_string(),
                    auth_blob: engine.credentials.auth_blob().unwrap().expose_secret().to_string(),
                },
                RuntimeCall::Create {
                    reference: "acct.region.amazonaws.com/app:prod-1.1.0".to_string()
                },
                RuntimeCall::Start {
                    id: "container-1".to_string()
                },
            ]
        );

        let rows = engine.snapshot().await;
        let slot = row(&rows, "prod");
        assert_eq!(slot.previous_tag, "prod-1.0.0");
        assert_eq!(slot.current_tag, "prod-1.1.0");
        assert_eq!(slot.container_id, "container-1");
    }

    #[tokio::test]
    async fn test_consecutive_updates_never_reuse_ids() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;

        engine.handle_update("app", "prod-1").await.unwrap();
        let outcome = engine.handle_update("app", "prod-2").await.unwrap();

        assert_eq!(
            outcome,
            RolloutOutcome::Replaced {
                old_container_id: "container-1".to_string(),
                container_id: "container-2".to_string()
            }
        );
        let rows = engine.snapshot().await;
        assert_eq!(row(&rows, "prod").previous_tag, "prod-1");
    }

    #[tokio::test]
    async fn test_unknown_repository_is_noop() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;
        let before = engine.snapshot().await;

        let outcome = engine.handle_update("other", "prod-1").await.unwrap();

        assert_eq!(outcome, RolloutOutcome::UnknownRepository);
        assert_eq!(runtime.operations(), vec!["list"]);
        assert_eq!(engine.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_unmatched_prefix_is_noop() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;

        let outcome = engine.handle_update("app", "staging-1").await.unwrap();

        assert_eq!(outcome, RolloutOutcome::NoMatchingPrefix);
        assert_eq!(runtime.operations(), vec!["list"]);
    }

    #[tokio::test]
    async fn test_pull_failure_leaves_container_unset_and_marks_failed() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;
        runtime.fail_on("pull");

        let result = engine.handle_update("app", "prod-1").await;

        assert!(matches!(
            result,
            Err(RolloutError::Runtime {
                operation: "pull",
                ..
            })
        ));
        assert_eq!(runtime.operations(), vec!["list", "pull"]);

        let rows = engine.snapshot().await;
        let slot = row(&rows, "prod");
        assert_eq!(slot.current_tag, "prod-1");
        assert!(!slot.has_container());
        assert!(matches!(slot.status, RolloutStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stop_failure_aborts_remaining_steps() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;
        engine.handle_update("app", "prod-1").await.unwrap();
        runtime.fail_on("stop");

        let result = engine.handle_update("app", "prod-2").await;

        assert!(matches!(
            result,
            Err(RolloutError::Runtime {
                operation: "stop",
                ..
            })
        ));
        assert_eq!(
            runtime.operations(),
            vec!["list", "pull", "create", "start", "stop"]
        );

        let rows = engine.snapshot().await;
        let slot = row(&rows, "prod");
        assert_eq!(slot.current_tag, "prod-2");
        assert_eq!(slot.previous_tag, "prod-1");
        assert_eq!(slot.container_id, "container-1");
    }

    #[tokio::test]
    async fn test_start_failure_keeps_created_container_owned() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;
        runtime.fail_on("start");

        assert!(engine.handle_update("app", "prod-1").await.is_err());
        runtime.recover("start");

        let outcome = engine.handle_update("app", "prod-2").await.unwrap();
        assert_eq!(
            outcome,
            RolloutOutcome::Replaced {
                old_container_id: "container-1".to_string(),
                container_id: "container-2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_registry_credentials_aborts_before_teardown() {
        let runtime = Arc::new(MockContainerRuntime::with_containers(vec![ContainerSummary {
            id: "old-id".to_string(),
            image_ref: "acct.region.amazonaws.com/app:prod-1".to_string(),
            state: "running".to_string(),
        }]));
        let identity = Arc::new(MockRegistryIdentity::new("AWS", "x"));
        let credentials = Arc::new(RegistryCredentials::new(identity));
        let engine = RolloutEngine::initialize(
            &[watched("/app", "prod")],
            runtime.clone(),
            credentials,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let result = engine.handle_update("app", "prod-2").await;

        assert!(matches!(
            result,
            Err(RolloutError::RegistryAuth(RegistryAuthError::NotAvailable))
        ));
        assert_eq!(runtime.operations(), vec!["list"]);
        let rows = engine.snapshot().await;
        assert_eq!(row(&rows, "prod").container_id, "old-id");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_runtime_call_times_out() {
        let runtime = Arc::new(MockContainerRuntime::new());
        runtime.stall_on("pull", Duration::from_secs(3600));
        let engine = RolloutEngine::initialize(
            &[watched("/app", "prod")],
            runtime.clone(),
            ready_credentials().await,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let result = engine.handle_update("app", "prod-1").await;

        assert!(matches!(
            result,
            Err(RolloutError::Timeout { operation: "pull" })
        ));
        // The lock is released, so the next event is processed.
        runtime.stall_on("pull", Duration::ZERO);
        assert!(engine.handle_update("app", "prod-2").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_rollout_leaves_row_pending() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = Arc::new(engine_with(&[watched("/app", "prod")], runtime.clone()).await);
        engine.handle_update("app", "prod-1").await.unwrap();
        runtime.stall_on("pull", Duration::from_secs(60));

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.handle_update("app", "prod-2").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // Cancelled after the old container was removed and before the pull
        let rows = engine.snapshot().await;
        let slot = row(&rows, "prod");
        assert_eq!(slot.status, RolloutStatus::Pending);
        assert_eq!(slot.current_tag, "prod-2");
        assert!(!slot.has_container());
        assert_eq!(
            runtime.operations(),
            vec!["list", "pull", "create", "start", "stop", "remove", "pull"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = Arc::new(
            engine_with(&[watched("/app", "prod"), watched("/web", "prod")], runtime.clone()).await,
        );

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.handle_update("app", "prod-1").await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.handle_update("web", "prod-1").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Each rollout's pull/create/start ran as an uninterrupted block.
        let ops = runtime.operations();
        assert_eq!(ops, vec!["list", "pull", "create", "start", "pull", "create", "start"]);
    }

    #[tokio::test]
    async fn test_untrack_repository() {
        let runtime = Arc::new(MockContainerRuntime::new());
        let engine = engine_with(&[watched("/app", "prod")], runtime.clone()).await;

        assert!(engine.untrack_repository("/app").await);
        assert!(!engine.untrack_repository("/app").await);
        assert!(engine.snapshot().await.is_empty());
        assert_eq!(
            engine.handle_update("app", "prod-1").await.unwrap(),
            RolloutOutcome::UnknownRepository
        );
    }

    #[tokio::test]
    async fn test_initialize_fails_when_runtime_unreachable() {
        let runtime = Arc::new(MockContainerRuntime::new());
        runtime.fail_on("list");

        let result = RolloutEngine::initialize(
            &[watched("/app", "prod")],
            runtime,
            ready_credentials().await,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::List(_))));
    }
}
