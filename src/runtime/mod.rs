mod docker;

pub use docker::DockerRuntime;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::RuntimeType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Raw runtime state, e.g. "running" or "exited"
    pub state: String,
    pub running: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;
    async fn is_available(&self) -> bool;
    /// List containers whose name matches `name_filter`. With `all` unset
    /// only running containers are returned.
    async fn list_containers(&self, name_filter: &str, all: bool) -> Result<Vec<ContainerInfo>>;
    async fn inspect(&self, container: &str) -> Result<ContainerInfo>;
}

/// A no-op runtime used when no container runtime is available
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    fn name(&self) -> &'static str {
        "none"
    }
    async fn is_available(&self) -> bool {
        false
    }
    async fn list_containers(&self, _name_filter: &str, _all: bool) -> Result<Vec<ContainerInfo>> {
        Ok(vec![])
    }
    async fn inspect(&self, _container: &str) -> Result<ContainerInfo> {
        anyhow::bail!("No container runtime available")
    }
}

pub async fn detect_runtime(config: &crate::config::RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config.runtime_type {
        RuntimeType::None => {
            tracing::info!("Container runtime disabled by configuration");
            Ok(Arc::new(NoopRuntime))
        }
        RuntimeType::Docker => match DockerRuntime::new(&config.docker_socket) {
            Ok(runtime) => Ok(Arc::new(runtime)),
            Err(e) => {
                tracing::warn!("Failed to connect to Docker: {}. Instances cannot be provisioned.", e);
                Ok(Arc::new(NoopRuntime))
            }
        },
        RuntimeType::Auto => {
            if let Ok(docker) = DockerRuntime::new(&config.docker_socket) {
                if docker.is_available().await {
                    tracing::info!("Auto-detected Docker runtime");
                    return Ok(Arc::new(docker));
                }
            }

            tracing::warn!("No container runtime available. Instances cannot be provisioned until Docker is running.");
            Ok(Arc::new(NoopRuntime))
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory runtime keyed by container name.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub available: Mutex<bool>,
        pub containers: Mutex<HashMap<String, bool>>,
        pub fail_listing: Mutex<bool>,
    }

    impl FakeRuntime {
        pub fn available() -> Self {
            let runtime = Self::default();
            *runtime.available.lock() = true;
            runtime
        }

        pub fn set_container(&self, name: &str, running: bool) {
            self.containers.lock().insert(name.to_string(), running);
        }

        pub fn remove_container(&self, name: &str) {
            self.containers.lock().remove(name);
        }

        fn info(name: &str, running: bool) -> ContainerInfo {
            ContainerInfo {
                id: format!("cid-{}", name),
                name: name.to_string(),
                state: if running { "running" } else { "exited" }.to_string(),
                running,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn is_available(&self) -> bool {
            *self.available.lock()
        }
        async fn list_containers(&self, name_filter: &str, all: bool) -> Result<Vec<ContainerInfo>> {
            if *self.fail_listing.lock() {
                anyhow::bail!("daemon error");
            }
            Ok(self
                .containers
                .lock()
                .iter()
                .filter(|(name, running)| name.contains(name_filter) && (all || **running))
                .map(|(name, running)| Self::info(name, *running))
                .collect())
        }
        async fn inspect(&self, container: &str) -> Result<ContainerInfo> {
            match self.containers.lock().get(container) {
                Some(running) => Ok(Self::info(container, *running)),
                None => anyhow::bail!("No such container: {}", container),
            }
        }
    }
}
