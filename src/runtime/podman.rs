use anyhow::Result;
use async_trait::async_trait;

use super::docker::DockerRuntime;
use super::{ContainerInfo, ContainerRuntime, ContainerSpec, ProgressSink, PruneReport};

/// Podman exposes a Docker-compatible API over its own socket, so this is a
/// pass-through to a `DockerRuntime` pointed at that socket instead of
/// reimplementing the adapter.
pub struct PodmanRuntime {
    inner: DockerRuntime,
}

impl PodmanRuntime {
    pub fn new(socket: &str) -> Result<Self> {
        let path = socket.strip_prefix("unix://").unwrap_or(socket);
        Ok(Self {
            inner: DockerRuntime::with_socket_path(path)?,
        })
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn pull_image(&self, tag: &str, on_progress: ProgressSink<'_>) -> Result<()> {
        self.inner.pull_image(tag, on_progress).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.inner.create_container(spec).await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.inner.start_container(id).await
    }

    async fn stop_container(&self, id: &str, grace_seconds: u32) -> Result<()> {
        self.inner.stop_container(id, grace_seconds).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.inner.remove_container(id, force).await
    }

    async fn inspect_status(&self, id: &str) -> Result<String> {
        self.inner.inspect_status(id).await
    }

    async fn list_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<ContainerInfo>> {
        self.inner.list_by_label(key, value).await
    }

    async fn remove_image(&self, tag: &str, force: bool) -> Result<()> {
        self.inner.remove_image(tag, force).await
    }

    async fn prune(&self) -> Result<PruneReport> {
        self.inner.prune().await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}
