//! Sandbox container lifecycle.
//!
//! One isolated container per flow (plus the shared browser container),
//! provisioned through the Docker engine. Spawn keeps the metadata shadow
//! in the persistence gateway honest: a record is `starting` before the
//! runtime container exists, `running` once it started, `failed` when any
//! step after record creation went wrong, `stopped` after teardown.

mod terminal;

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use tokio::task::JoinSet;

use crate::db::{ContainerStatus, FlowStatus, Storage};
use crate::error::SandboxError;
use crate::hub::Hub;

pub use terminal::{browser_name, format_terminal_input, format_terminal_system, terminal_name};

/// Image used when the requested one cannot be pulled or is not allowed.
pub const DEFAULT_IMAGE: &str = "debian:latest";

/// On-disk scratch tree removed wholesale at cleanup.
const SCRATCH_DIR: &str = "./tmp";

/// Grace period for container stops, in seconds.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Connect to the Docker engine. Called once at startup; failure is fatal.
pub fn connect_docker() -> Result<Docker, SandboxError> {
    Docker::connect_with_local_defaults().map_err(|source| SandboxError::Client { source })
}

/// What to run in a new sandbox container.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// TCP port to expose and bind on the host (browser debug port).
    pub port: Option<u16>,
}

/// Lifecycle manager for sandbox containers.
#[derive(Clone)]
pub struct SandboxManager {
    docker: Docker,
    store: Arc<dyn Storage>,
    hub: Arc<Hub>,
}

impl SandboxManager {
    pub fn new(docker: Docker, store: Arc<dyn Storage>, hub: Arc<Hub>) -> Self {
        Self { docker, store, hub }
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.docker
    }

    pub(crate) fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub(crate) fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Provision a container: create the record, make sure the image is
    /// available, create and start the runtime container, advance the
    /// record to `running`. Returns the record id.
    pub async fn spawn(&self, name: &str, spec: SpawnSpec) -> Result<i64, SandboxError> {
        tracing::info!(name, image = %spec.image, "spawning container");

        let record = self.store.create_container(name, &spec.image).await?;

        match self.create_and_start(name, &spec).await {
            Ok(local_id) => {
                self.store
                    .update_container_local_id(record.id, &local_id)
                    .await?;
                self.store
                    .update_container_status(record.id, ContainerStatus::Running)
                    .await?;
                tracing::info!(name, %local_id, "container running");
                Ok(record.id)
            }
            Err(e) => {
                // Tear down whatever half-started; the record moves to failed.
                if let Err(stop_err) = self.stop(name, record.id).await {
                    tracing::error!(
                        container = name,
                        error = %stop_err,
                        "failed to stop container after spawn error"
                    );
                }
                if let Err(db_err) = self
                    .store
                    .update_container_status(record.id, ContainerStatus::Failed)
                    .await
                {
                    tracing::error!(record_id = record.id, error = %db_err,
                        "failed to mark container record failed");
                }
                Err(e)
            }
        }
    }

    async fn create_and_start(&self, name: &str, spec: &SpawnSpec) -> Result<String, SandboxError> {
        let image = self.ensure_image(&spec.image).await;

        let (exposed_ports, port_bindings) = match spec.port {
            Some(port) => {
                let key = format!("{port}/tcp");
                let exposed: HashMap<String, HashMap<(), ()>> =
                    HashMap::from([(key.clone(), HashMap::new())]);
                let bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.to_string()),
                    }]),
                )]);
                (Some(exposed), Some(bindings))
            }
            None => (None, None),
        };

        let config = Config {
            image: Some(image),
            cmd: Some(spec.cmd.clone()),
            exposed_ports,
            host_config: Some(HostConfig {
                port_bindings,
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "create_container",
                container_id: name.to_string(),
                source,
            })?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "start_container",
                container_id: response.id.clone(),
                source,
            })?;

        Ok(response.id)
    }

    /// Make sure `image` is locally present, pulling it if needed. Returns
    /// the image to use; pull failures fall back to [`DEFAULT_IMAGE`].
    async fn ensure_image(&self, image: &str) -> String {
        let filters = HashMap::from([("reference".to_string(), vec![image.to_string()])]);
        match self
            .docker
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await
        {
            Ok(images) if !images.is_empty() => {
                tracing::debug!(image, "image exists locally");
                return image.to_string();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(image, error = %e, "error listing images, using default");
                return DEFAULT_IMAGE.to_string();
            }
        }

        tracing::info!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            if let Err(e) = progress {
                tracing::warn!(image, error = %e, default = DEFAULT_IMAGE,
                    "failed to pull image, using default");
                return DEFAULT_IMAGE.to_string();
            }
        }

        image.to_string()
    }

    /// Stop a runtime container and advance its record to `stopped`. A
    /// "not found" from the engine means the container is already gone:
    /// treated as success, the record is still advanced.
    pub async fn stop(&self, runtime_id: &str, record_id: i64) -> Result<(), SandboxError> {
        match self
            .docker
            .stop_container(runtime_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                tracing::debug!(container = runtime_id, "container not found, marking stopped");
            }
            Err(source) => {
                return Err(SandboxError::Runtime {
                    op: "stop_container",
                    container_id: runtime_id.to_string(),
                    source,
                });
            }
        }

        self.store
            .update_container_status(record_id, ContainerStatus::Stopped)
            .await?;
        Ok(())
    }

    /// Stop then remove a container.
    pub async fn delete(&self, runtime_id: &str, record_id: i64) -> Result<(), SandboxError> {
        self.stop(runtime_id, record_id).await?;

        match self
            .docker
            .remove_container(runtime_id, None::<RemoveContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(source) => Err(SandboxError::Runtime {
                op: "remove_container",
                container_id: runtime_id.to_string(),
                source,
            }),
        }
    }

    /// Is the runtime container up?
    pub async fn is_running(&self, runtime_id: &str) -> Result<bool, SandboxError> {
        let inspection = self
            .docker
            .inspect_container(runtime_id, None)
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "inspect_container",
                container_id: runtime_id.to_string(),
                source,
            })?;
        Ok(inspection
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    /// Shutdown cleanup: remove the scratch tree, tear down every running
    /// container in parallel, and finish all in-progress flows. Idempotent
    /// and best-effort; individual failures are logged, never fatal.
    pub async fn cleanup(&self) {
        tracing::info!("cleanup starting");

        if let Err(e) = tokio::fs::remove_dir_all(SCRATCH_DIR).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::error!(error = %e, "failed to remove scratch directory");
        }

        let containers = match self.store.running_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                tracing::error!(error = %e, "failed to list running containers");
                Vec::new()
            }
        };
        let cleaned = containers.len();

        let mut teardowns = JoinSet::new();
        for container in containers {
            let manager = self.clone();
            teardowns.spawn(async move {
                if let Err(e) = manager.delete(&container.local_id, container.id).await {
                    tracing::error!(
                        container = %container.local_id,
                        error = %e,
                        "failed to delete container"
                    );
                }
            });
        }
        while teardowns.join_next().await.is_some() {}

        match self.store.read_all_flows().await {
            Ok(flows) => {
                for flow in flows {
                    if flow.status == FlowStatus::InProgress
                        && let Err(e) = self
                            .store
                            .update_flow_status(flow.id, FlowStatus::Finished)
                            .await
                    {
                        tracing::error!(flow_id = flow.id, error = %e,
                            "failed to finish flow during cleanup");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to list flows during cleanup"),
        }

        tracing::info!(containers_cleaned = cleaned, "cleanup completed");
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemStore;

    fn test_manager() -> (SandboxManager, Arc<dyn Storage>) {
        let store: Arc<dyn Storage> = Arc::new(MemStore::new());
        let hub = Arc::new(Hub::new());
        // The client is lazy; these tests never reach the engine.
        let docker = connect_docker().expect("lazy docker client");
        (
            SandboxManager::new(docker, Arc::clone(&store), hub),
            store,
        )
    }

    #[test]
    fn not_found_detection_matches_engine_404s() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_not_found(&missing));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(!is_not_found(&conflict));
    }

    #[tokio::test]
    async fn cleanup_finishes_flows_and_is_idempotent() {
        let (manager, store) = test_manager();
        let flow = store.create_flow("openai", "gpt-4o").await.unwrap();

        manager.cleanup().await;
        assert_eq!(
            store.read_flow(flow.id).await.unwrap().status,
            FlowStatus::Finished
        );

        // A second pass changes nothing and must not fail.
        manager.cleanup().await;
        assert_eq!(
            store.read_flow(flow.id).await.unwrap().status,
            FlowStatus::Finished
        );
        assert!(store.running_containers().await.unwrap().is_empty());
    }
}
