//! Status probing for provisioned instances.
//!
//! An instance's state is read from its representative container: absent or
//! exited means `stopped`, running means `running` once the gateway answers
//! and `starting` before that. Runtime failures surface as `error`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::readiness::LivenessProbe;
use super::InstanceManager;
use crate::config::{MonitorConfig, RuntimeConfig};
use crate::registry::{Instance, InstanceStatus};
use crate::runtime::ContainerRuntime;

pub struct StatusProber {
    runtime: Arc<dyn ContainerRuntime>,
    liveness: LivenessProbe,
    runtime_config: RuntimeConfig,
    inspect_timeout: Duration,
    liveness_timeout: Duration,
}

impl StatusProber {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        liveness: LivenessProbe,
        runtime_config: RuntimeConfig,
        monitor: &MonitorConfig,
    ) -> Self {
        Self {
            runtime,
            liveness,
            runtime_config,
            inspect_timeout: Duration::from_secs(monitor.inspect_timeout_secs),
            liveness_timeout: Duration::from_secs(monitor.liveness_timeout_secs),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Observe the current status of `instance`. Never fails.
    pub async fn probe(&self, instance: &Instance) -> InstanceStatus {
        let container = self.runtime_config.probe_container_name(&instance.id);
        let listing = tokio::time::timeout(
            self.inspect_timeout,
            self.runtime.list_containers(&container, true),
        )
        .await;

        let containers = match listing {
            Ok(Ok(containers)) => containers,
            Ok(Err(e)) => {
                tracing::warn!(instance = %instance.id, error = %e, "Container inspection failed");
                return InstanceStatus::Error;
            }
            Err(_) => {
                tracing::warn!(
                    instance = %instance.id,
                    timeout_secs = self.inspect_timeout.as_secs(),
                    "Container inspection timed out"
                );
                return InstanceStatus::Error;
            }
        };

        // The name filter matches substrings; only the exact name counts.
        let running = containers
            .iter()
            .find(|c| c.name == container)
            .map(|c| c.running)
            .unwrap_or(false);

        if !running {
            return InstanceStatus::Stopped;
        }

        if self
            .liveness
            .check(instance.ports.http_gateway, self.liveness_timeout)
            .await
        {
            InstanceStatus::Running
        } else {
            InstanceStatus::Starting
        }
    }
}

/// Spawn the periodic status sweep over every registered instance.
pub fn spawn_status_sweep(manager: Arc<InstanceManager>, config: MonitorConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("Status sweep is disabled");
        return None;
    }

    let sweep_interval = config.sweep_interval_secs.max(1);
    tracing::info!(sweep_interval_secs = sweep_interval, "Starting status sweep task");

    Some(tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(sweep_interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            let result = manager.refresh_statuses().await;
            if result.changed > 0 {
                tracing::info!(
                    checked = result.checked,
                    changed = result.changed,
                    skipped = result.skipped,
                    "Status sweep found changes"
                );
            } else {
                tracing::debug!(checked = result.checked, skipped = result.skipped, "Status sweep complete");
            }
        }
    }))
}
