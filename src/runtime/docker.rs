use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use std::collections::HashMap;

use super::{ContainerInfo, ContainerRuntime};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> Result<Self> {
        // On Windows, always use local defaults (named pipe)
        // On Unix, use socket path if specified
        let client = if cfg!(windows) || socket.starts_with("npipe://") || socket.starts_with("tcp://") {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
        };

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "Docker"
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn list_containers(&self, name_filter: &str, all: bool) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_filter.to_string()]);

        let options = ListContainersOptions {
            all,
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
            .map(|container| {
                let name = container
                    .names
                    .and_then(|names| names.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string();
                let state = container.state.unwrap_or_default().to_lowercase();

                ContainerInfo {
                    id: container.id.unwrap_or_default(),
                    name,
                    running: state == "running",
                    state,
                }
            })
            .collect())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInfo> {
        let info = self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let (running, state) = info
            .state
            .as_ref()
            .map(|s| {
                let state = s
                    .status
                    .as_ref()
                    .map(|st| format!("{:?}", st).to_lowercase())
                    .unwrap_or_default();
                (s.running.unwrap_or(false), state)
            })
            .unwrap_or((false, String::new()));

        Ok(ContainerInfo {
            id: info.id.unwrap_or_default(),
            name: info.name.unwrap_or_default().trim_start_matches('/').to_string(),
            state,
            running,
        })
    }
}
