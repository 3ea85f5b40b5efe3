//! Container runtime collaborator.
//!
//! The rollout engine only needs six operations from the runtime: list,
//! pull, create, start, stop and remove. They sit behind `ContainerRuntime`
//! so the engine can be driven by `mock::MockContainerRuntime` in tests and
//! by `DockerRuntime` (Docker Engine API via bollard) in production.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::TryStreamExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Seconds Docker waits for a container to exit before killing it.
const STOP_GRACE_SECONDS: i64 = 10;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {0}")]
    Connection(String),

    #[error("Failed to list containers: {0}")]
    List(String),

    #[error("Failed to pull image: {0}")]
    Pull(String),

    #[error("Invalid registry credentials: {0}")]
    InvalidAuth(String),

    #[error("Failed to create container: {0}")]
    Create(String),

    #[error("Failed to start container: {0}")]
    Start(String),

    #[error("Failed to stop container: {0}")]
    Stop(String),

    #[error("Failed to remove container: {0}")]
    Remove(String),
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Image reference the container was created from, e.g. `host/app:prod-1`.
    pub image_ref: String,
    /// Runtime state, e.g. `running`, `exited`.
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Operations the rollout engine performs against the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List all containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Pull `reference` using the encoded registry login blob.
    async fn pull_image(&self, reference: &str, auth_blob: &str) -> Result<(), RuntimeError>;

    /// Create a container from `reference`, returning its id.
    async fn create_container(&self, reference: &str) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Registry login carried inside the auth blob.
#[derive(Deserialize)]
struct RegistryLogin {
    username: String,
    password: String,
}

/// Decode a `base64url(json{"username","password"})` blob into Docker credentials.
///
/// The registry server address is the host part of `reference`.
fn credentials_from_blob(
    reference: &str,
    auth_blob: &str,
) -> Result<DockerCredentials, RuntimeError> {
    let decoded = general_purpose::URL_SAFE
        .decode(auth_blob)
        .map_err(|e| RuntimeError::InvalidAuth(format!("auth blob is not base64: {}", e)))?;
    let login: RegistryLogin = serde_json::from_slice(&decoded)
        .map_err(|e| RuntimeError::InvalidAuth(format!("auth blob is not a login: {}", e)))?;

    let server = reference.split('/').next().unwrap_or_default();

    Ok(DockerCredentials {
        username: Some(login.username),
        password: Some(login.password),
        serveraddress: Some(server.to_string()),
        ..Default::default()
    })
}

/// Docker Engine implementation of `ContainerRuntime`.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip_all, name = "rc.runtime.list")]
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::List(e.to_string()))?;

        let summaries: Vec<ContainerSummary> = containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image_ref: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                })
            })
            .collect();

        debug!(target: "rc.runtime", count = summaries.len(), "Listed containers");
        Ok(summaries)
    }

    #[instrument(skip(self, auth_blob), name = "rc.runtime.pull")]
    async fn pull_image(&self, reference: &str, auth_blob: &str) -> Result<(), RuntimeError> {
        let credentials = credentials_from_blob(reference, auth_blob)?;

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: reference.to_string(),
                    ..Default::default()
                }),
                None,
                Some(credentials),
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| RuntimeError::Pull(e.to_string()))?;

        info!(target: "rc.runtime", reference = %reference, "Image pulled");
        Ok(())
    }

    #[instrument(skip(self), name = "rc.runtime.create")]
    async fn create_container(&self, reference: &str) -> Result<String, RuntimeError> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                ContainerConfig {
                    image: Some(reference.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Create(e.to_string()))?;

        info!(target: "rc.runtime", container_id = %response.id, "Container created");
        Ok(response.id)
    }

    #[instrument(skip(self), name = "rc.runtime.start")]
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Start(e.to_string()))
    }

    #[instrument(skip(self), name = "rc.runtime.stop")]
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            )
            .await
            .map_err(|e| RuntimeError::Stop(e.to_string()))
    }

    #[instrument(skip(self), name = "rc.runtime.remove")]
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::Remove(e.to_string()))
    }
}

/// Mock container runtime for testing.
///
/// Records every call in order, hands out sequential container ids
/// (`container-1`, `container-2`, ...) and can be told to fail or stall on
/// a given operation.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// A recorded runtime call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RuntimeCall {
        List,
        Pull {
            reference: String,
            auth_blob: String,
        },
        Create {
            reference: String,
        },
        Start {
            id: String,
        },
        Stop {
            id: String,
        },
        Remove {
            id: String,
        },
    }

    impl RuntimeCall {
        /// Operation name as used by `fail_on` / `stall_on`.
        pub fn operation(&self) -> &'static str {
            match self {
                RuntimeCall::List => "list",
                RuntimeCall::Pull { .. } => "pull",
                RuntimeCall::Create { .. } => "create",
                RuntimeCall::Start { .. } => "start",
                RuntimeCall::Stop { .. } => "stop",
                RuntimeCall::Remove { .. } => "remove",
            }
        }
    }

    /// Mock runtime with call recording.
    #[derive(Default)]
    pub struct MockContainerRuntime {
        containers: Mutex<Vec<ContainerSummary>>,
        calls: Mutex<Vec<RuntimeCall>>,
        failing: Mutex<HashSet<&'static str>>,
        stalls: Mutex<HashMap<&'static str, Duration>>,
        next_id: AtomicUsize,
    }

    impl MockContainerRuntime {
        /// Create a runtime with no containers.
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a runtime that reports the given containers from `list_containers`.
        pub fn with_containers(containers: Vec<ContainerSummary>) -> Self {
            let runtime = Self::default();
            *runtime.containers.lock().unwrap_or_else(PoisonError::into_inner) = containers;
            runtime
        }

        /// Make every call of `operation` ("list", "pull", "create", "start",
        /// "stop", "remove") fail. The failed call is still recorded.
        pub fn fail_on(&self, operation: &'static str) {
            self.failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(operation);
        }

        /// Stop failing `operation`.
        pub fn recover(&self, operation: &'static str) {
            self.failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(operation);
        }

        /// Delay every call of `operation` by `delay` before it completes.
        pub fn stall_on(&self, operation: &'static str, delay: Duration) {
            self.stalls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(operation, delay);
        }

        /// All calls made so far, in order.
        pub fn calls(&self) -> Vec<RuntimeCall> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Operation names of all calls made so far, in order.
        pub fn operations(&self) -> Vec<&'static str> {
            self.calls().iter().map(RuntimeCall::operation).collect()
        }

        /// Number of calls made so far.
        pub fn call_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        async fn record(&self, call: RuntimeCall) -> Result<(), String> {
            let operation = call.operation();
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);

            let stall = self
                .stalls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(operation)
                .copied();
            if let Some(delay) = stall {
                tokio::time::sleep(delay).await;
            }

            if self
                .failing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(operation)
            {
                return Err(format!("mock {} failure", operation));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockContainerRuntime {
        async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
            self.record(RuntimeCall::List)
                .await
                .map_err(RuntimeError::List)?;
            Ok(self
                .containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        }

        async fn pull_image(&self, reference: &str, auth_blob: &str) -> Result<(), RuntimeError> {
            self.record(RuntimeCall::Pull {
                reference: reference.to_string(),
                auth_blob: auth_blob.to_string(),
            })
            .await
            .map_err(RuntimeError::Pull)
        }

        async fn create_container(&self, reference: &str) -> Result<String, RuntimeError> {
            self.record(RuntimeCall::Create {
                reference: reference.to_string(),
            })
            .await
            .map_err(RuntimeError::Create)?;

            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("container-{}", n);
            self.containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ContainerSummary {
                    id: id.clone(),
                    image_ref: reference.to_string(),
                    state: "created".to_string(),
                });
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(RuntimeCall::Start { id: id.to_string() })
                .await
                .map_err(RuntimeError::Start)?;
            self.set_state(id, "running");
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(RuntimeCall::Stop { id: id.to_string() })
                .await
                .map_err(RuntimeError::Stop)?;
            self.set_state(id, "exited");
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
            self.record(RuntimeCall::Remove { id: id.to_string() })
                .await
                .map_err(RuntimeError::Remove)?;
            self.containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|c| c.id != id);
            Ok(())
        }
    }

    impl MockContainerRuntime {
        fn set_state(&self, id: &str, state: &str) {
            let mut containers = self
                .containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(container) = containers.iter_mut().find(|c| c.id == id) {
                container.state = state.to_string();
            }
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_hands_out_sequential_ids() {
            let runtime = MockContainerRuntime::new();

            let first = runtime.create_container("host/app:1").await.unwrap();
            let second = runtime.create_container("host/app:2").await.unwrap();

            assert_eq!(first, "container-1");
            assert_eq!(second, "container-2");
            assert_eq!(runtime.operations(), vec!["create", "create"]);
        }

        #[tokio::test]
        async fn test_mock_failure_is_recorded() {
            let runtime = MockContainerRuntime::new();
            runtime.fail_on("pull");

            let result = runtime.pull_image("host/app:1", "blob").await;

            assert!(matches!(result, Err(RuntimeError::Pull(_))));
            assert_eq!(runtime.call_count(), 1);

            runtime.recover("pull");
            assert!(runtime.pull_image("host/app:1", "blob").await.is_ok());
        }

        #[tokio::test]
        async fn test_mock_tracks_container_lifecycle() {
            let runtime = MockContainerRuntime::new();

            let id = runtime.create_container("host/app:1").await.unwrap();
            runtime.start_container(&id).await.unwrap();
            let listed = runtime.list_containers().await.unwrap();
            assert!(listed.iter().any(|c| c.id == id && c.is_running()));

            runtime.stop_container(&id).await.unwrap();
            runtime.remove_container(&id).await.unwrap();
            let listed = runtime.list_containers().await.unwrap();
            assert!(listed.is_empty());
        }
    }
}
