use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::volume::PruneVolumesOptions;
use bollard::Docker;
use futures::StreamExt;

use super::{ContainerInfo, ContainerRuntime, ContainerSpec, ProgressSink, PruneReport};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> Result<Self> {
        let client = if cfg!(windows) || socket.starts_with("tcp://") {
            Docker::connect_with_local_defaults()?
        } else {
            let path = socket.strip_prefix("unix://").unwrap_or(socket);
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { client })
    }

    /// Construct a runtime pointed at an arbitrary Docker-API-compatible
    /// socket (used by `PodmanRuntime`, whose daemon speaks the same API).
    pub fn with_socket_path(path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client })
    }
}

/// Split an image reference into `(from_image, tag)` the way Bollard's pull
/// API expects; handles digests, registries with ports, and bare names.
fn parse_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    if let Some((name, tag_part)) = image.rsplit_once(':') {
        if !tag_part.contains('/') {
            return (name.to_string(), tag_part.to_string());
        }
    }
    (image.to_string(), "latest".to_string())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, tag: &str, on_progress: ProgressSink<'_>) -> Result<()> {
        let (from_image, image_tag) = parse_image_ref(tag);
        let options = CreateImageOptions {
            from_image,
            tag: image_tag,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        let line = match info.progress {
                            Some(progress) => format!("{status}: {progress}"),
                            None => status,
                        };
                        on_progress(line);
                    }
                    if let Some(error) = info.error {
                        anyhow::bail!("image pull failed: {error}");
                    }
                }
                Err(e) => anyhow::bail!("image pull failed: {e}"),
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        if let Some(port) = spec.exposed_port {
            exposed_ports.insert(format!("{port}/tcp"), HashMap::new());
        }

        let restart_policy = bollard::service::RestartPolicy {
            name: Some(bollard::service::RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        };

        let host_config = bollard::service::HostConfig {
            restart_policy: Some(restart_policy),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .context("Failed to create container")?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self.client.start_container::<String>(id, None).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to start container: {e}")),
        }
    }

    async fn stop_container(&self, id: &str, grace_seconds: u32) -> Result<()> {
        let options = StopContainerOptions {
            t: grace_seconds as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {e}")),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container: {e}")),
        }
    }

    async fn inspect_status(&self, id: &str) -> Result<String> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .context("Failed to inspect container")?;
        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_default())
    }

    async fn list_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        let label_filter = match value {
            Some(v) => format!("{key}={v}"),
            None => key.to_string(),
        };
        filters.insert("label".to_string(), vec![label_filter]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_image(&self, tag: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            noprune: false,
        };
        match self.client.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove image: {e}")),
        }
    }

    async fn prune(&self) -> Result<PruneReport> {
        let containers = self
            .client
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .context("Failed to prune containers")?;

        let images = self
            .client
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .context("Failed to prune images")?;

        let volumes = self
            .client
            .prune_volumes(None::<PruneVolumesOptions<String>>)
            .await
            .context("Failed to prune volumes")?;

        Ok(PruneReport {
            containers_removed: containers
                .containers_deleted
                .map(|c| c.len() as u64)
                .unwrap_or(0),
            images_removed: images.images_deleted.map(|i| i.len() as u64).unwrap_or(0),
            volumes_removed: volumes.volumes_deleted.map(|v| v.len() as u64).unwrap_or(0),
            space_reclaimed_bytes: containers.space_reclaimed.unwrap_or(0) as u64
                + images.space_reclaimed.unwrap_or(0) as u64
                + volumes.space_reclaimed.unwrap_or(0) as u64,
        })
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_image() {
        assert_eq!(parse_image_ref("postgres:16"), ("postgres".into(), "16".into()));
    }

    #[test]
    fn parses_bare_image_as_latest() {
        assert_eq!(parse_image_ref("nginx"), ("nginx".into(), "latest".into()));
    }

    #[test]
    fn parses_registry_with_port_and_no_tag() {
        assert_eq!(
            parse_image_ref("registry:5000/image"),
            ("registry:5000/image".into(), "latest".into())
        );
    }

    #[test]
    fn parses_registry_with_port_and_tag() {
        assert_eq!(
            parse_image_ref("registry:5000/image:v1"),
            ("registry:5000/image".into(), "v1".into())
        );
    }

    #[test]
    fn parses_digest_reference() {
        let (name, tag) = parse_image_ref("nginx@sha256:abcd");
        assert_eq!(name, "nginx@sha256:abcd");
        assert_eq!(tag, "");
    }
}
