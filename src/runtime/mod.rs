mod docker;
mod podman;

pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RuntimeType;

/// Everything needed to create a container for one ServiceInstance.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub exposed_port: Option<u16>,
    pub network: String,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub containers_removed: u64,
    pub images_removed: u64,
    pub volumes_removed: u64,
    pub space_reclaimed_bytes: u64,
}

/// Callback invoked with one progress line per pull event.
pub type ProgressSink<'a> = &'a (dyn Fn(String) + Send + Sync);

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Stream pull progress to `on_progress`; succeeds when the pull event
    /// stream ends without error. Image-not-found is a fatal error.
    async fn pull_image(&self, tag: &str, on_progress: ProgressSink<'_>) -> Result<()>;
    /// Create (but do not start) a container. Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    /// Idempotent: already-running is success.
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Idempotent: already-stopped / not-found is success.
    async fn stop_container(&self, id: &str, grace_seconds: u32) -> Result<()>;
    /// Idempotent: not-found is success.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;
    /// Returns the runtime-reported state string (e.g. "running", "exited").
    async fn inspect_status(&self, id: &str) -> Result<String>;
    /// Containers bearing `key` (and `value` if given), used by the Reconciler
    /// to find all containers tagged as managed by this system.
    async fn list_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<ContainerInfo>>;
    /// Not-found is success.
    async fn remove_image(&self, tag: &str, force: bool) -> Result<()>;
    /// Prunes stopped containers, dangling images, unused volumes.
    async fn prune(&self) -> Result<PruneReport>;
    async fn is_available(&self) -> bool;
}

/// Used only when neither Docker nor Podman is reachable. Logs a warning and
/// fails every mutating call.
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn pull_image(&self, _tag: &str, _on_progress: ProgressSink<'_>) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn start_container(&self, _id: &str) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn stop_container(&self, _id: &str, _grace_seconds: u32) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn remove_container(&self, _id: &str, _force: bool) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn inspect_status(&self, _id: &str) -> Result<String> {
        anyhow::bail!("No container runtime available")
    }
    async fn list_by_label(&self, _key: &str, _value: Option<&str>) -> Result<Vec<ContainerInfo>> {
        Ok(vec![])
    }
    async fn remove_image(&self, _tag: &str, _force: bool) -> Result<()> {
        anyhow::bail!("No container runtime available")
    }
    async fn prune(&self) -> Result<PruneReport> {
        anyhow::bail!("No container runtime available")
    }
    async fn is_available(&self) -> bool {
        false
    }
}

pub async fn detect_runtime(config: &crate::config::RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config.runtime_type {
        RuntimeType::Docker => match DockerRuntime::new(&config.docker_socket) {
            Ok(runtime) => Ok(Arc::new(runtime)),
            Err(e) => {
                tracing::warn!("Failed to connect to Docker: {}. Previews will not deploy.", e);
                Ok(Arc::new(NoopRuntime))
            }
        },
        RuntimeType::Podman => Ok(Arc::new(PodmanRuntime::new(&config.podman_socket)?)),
        RuntimeType::Auto => {
            if let Ok(docker) = DockerRuntime::new(&config.docker_socket) {
                if docker.is_available().await {
                    tracing::info!("Auto-detected Docker runtime");
                    return Ok(Arc::new(docker));
                }
            }

            if let Ok(podman) = PodmanRuntime::new(&config.podman_socket) {
                if podman.is_available().await {
                    tracing::info!("Auto-detected Podman runtime");
                    return Ok(Arc::new(podman));
                }
            }

            tracing::warn!("No container runtime available. Previews will not deploy until Docker or Podman is installed.");
            Ok(Arc::new(NoopRuntime))
        }
    }
}
