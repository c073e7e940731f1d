//! Instance lifecycle orchestration.
//!
//! [`InstanceManager`] owns every piece of shared mutable state: the registry
//! (behind one async mutex, so all read-modify-write cycles are serialized),
//! the reserved-port set, and the creation lock. Operations on the same
//! instance id are ordered through a per-id guard; operations on different
//! ids proceed concurrently.
//!
//! Creation runs admission and allocation under the creation lock, persists
//! the record as `creating`, then drives the provisioning tail
//! (`downloading` → `starting` → `running`, or `error`) either in a detached
//! task or inline, depending on [`CreationMode`].

mod lock;
mod ports;
mod prober;
mod provisioner;
mod readiness;
mod resources;
mod retry;

pub use lock::*;
pub use ports::*;
pub use prober::*;
pub use provisioner::*;
pub use readiness::*;
pub use resources::*;
pub use retry::*;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::{Config, CreationMode};
use crate::credentials::{self, DashboardLogin};
use crate::error::{InstanceError, InstanceResult};
use crate::notifications::{StatusEvent, StatusNotifier};
use crate::registry::{DockerArtifacts, Instance, InstanceStatus, InstanceUrls, Registry};
use crate::runtime::ContainerRuntime;

const RUNTIME_PING_TIMEOUT: Duration = Duration::from_secs(5);
const ID_LENGTH: usize = 8;
const MAX_NAME_LENGTH: usize = 64;
const MIN_DASHBOARD_USERNAME: usize = 3;
const MIN_DASHBOARD_PASSWORD: usize = 4;

/// Error message recorded when the runtime could not be inspected. Unlike
/// provisioning failures, it is replaced by the next successful probe.
const INSPECTION_FAILED: &str = "container runtime inspection failed";

/// Config keys that override the generated dashboard login. They are moved
/// into the credentials and not kept in `config`.
const DASHBOARD_USERNAME_KEY: &str = "dashboard_username";
const DASHBOARD_PASSWORD_KEY: &str = "dashboard_password";

/// An instance together with its derived URLs.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    pub urls: InstanceUrls,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub max_instances: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceList {
    pub instances: Vec<InstanceView>,
    pub stats: InstanceStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub id: String,
    pub name: String,
    /// Teardown steps that failed and were skipped
    pub warnings: Vec<String>,
}

impl DeleteReport {
    pub fn message(&self) -> String {
        if self.warnings.is_empty() {
            format!("Instance '{}' deleted", self.name)
        } else {
            format!(
                "Instance '{}' deleted with {} warning(s): {}",
                self.name,
                self.warnings.len(),
                self.warnings.join("; ")
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepResult {
    pub checked: usize,
    pub changed: usize,
    /// Busy or provisioning instances left alone this round
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub removed: Vec<String>,
}

pub struct InstanceManager {
    config: Config,
    registry: Mutex<Registry>,
    ports: PortAllocator,
    lock: CreationLock,
    op_guards: DashMap<String, Arc<Mutex<()>>>,
    provisioner: Arc<dyn Provisioner>,
    validator: ResourceValidator,
    prober: StatusProber,
    liveness: LivenessProbe,
    notifier: StatusNotifier,
}

impl InstanceManager {
    pub fn new(
        config: Config,
        registry: Registry,
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<dyn Provisioner>,
        host_probe: Box<dyn HostProbe>,
    ) -> anyhow::Result<Self> {
        let liveness = LivenessProbe::new(LOCAL_HOST, &config.provisioning.liveness_path)?;
        let prober = StatusProber::new(
            runtime,
            liveness.clone(),
            config.runtime.clone(),
            &config.monitor,
        );

        Ok(Self {
            ports: PortAllocator::new(config.ports.clone(), registry.used_ports()),
            lock: CreationLock::new(Duration::from_secs(config.lock.stale_after_secs)),
            validator: ResourceValidator::new(host_probe, config.resources.clone()),
            registry: Mutex::new(registry),
            op_guards: DashMap::new(),
            provisioner,
            prober,
            liveness,
            notifier: StatusNotifier::new(),
            config,
        })
    }

    /// Build a manager wired to the real host: registry loaded from the data
    /// directory, compose-based provisioning and `/proc` resource checks.
    pub async fn from_config(config: Config, runtime: Arc<dyn ContainerRuntime>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.server.data_dir.display())
        })?;
        let registry = Registry::load(
            config.server.registry_path(),
            &config.provisioning.default_owner,
        )
        .await?;

        let provisioner = Arc::new(ComposeProvisioner::new(
            &config.provisioning.stack_dir,
            config.provisioning.script_path(),
            &config.server.external_host,
            config.provisioning.compose_timeout(),
        ));
        let host_probe = Box::new(SystemHostProbe::new(&config.provisioning.stack_dir));

        let manager = Self::new(config, registry, runtime, provisioner, host_probe)?;
        manager.recover_interrupted().await?;
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.notifier.subscribe()
    }

    fn stack_dir(&self) -> &Path {
        &self.config.provisioning.stack_dir
    }

    fn op_guard(&self, id: &str) -> Arc<Mutex<()>> {
        self.op_guards.entry(id.to_string()).or_default().clone()
    }

    async fn runtime_available(&self) -> bool {
        tokio::time::timeout(RUNTIME_PING_TIMEOUT, self.prober.runtime().is_available())
            .await
            .unwrap_or(false)
    }

    /// Records left mid-provisioning by a previous process can never finish.
    pub async fn recover_interrupted(&self) -> InstanceResult<usize> {
        let stuck: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|i| i.status.is_provisioning())
                .map(|i| i.id.clone())
                .collect()
        };

        for id in &stuck {
            tracing::warn!(instance = %id, "Provisioning was interrupted by a restart");
            self.set_status(
                id,
                InstanceStatus::Error,
                Some("provisioning interrupted by a manager restart".to_string()),
            )
            .await?;
        }
        Ok(stuck.len())
    }

    // --- creation -------------------------------------------------------

    /// Create an instance owned by the configured default owner.
    pub async fn create(self: &Arc<Self>, name: &str, config: Map<String, Value>) -> InstanceResult<Instance> {
        self.create_as(None, name, config).await
    }

    pub async fn create_as(
        self: &Arc<Self>,
        owner: Option<&str>,
        name: &str,
        mut config: Map<String, Value>,
    ) -> InstanceResult<Instance> {
        let lease = self.lock.try_acquire(Uuid::new_v4().to_string())?;
        let name = name.trim();

        self.admit(name).await?;

        let dashboard = DashboardLogin {
            username: take_string(&mut config, DASHBOARD_USERNAME_KEY),
            password: take_string(&mut config, DASHBOARD_PASSWORD_KEY),
        };

        let id = self.new_instance_id().await;
        // Each candidate port is test-bound on the host.
        let allocator = Arc::clone(self);
        let ports = tokio::task::spawn_blocking(move || allocator.ports.allocate_all())
            .await
            .map_err(|e| {
                InstanceError::provisioning(anyhow::Error::new(e).context("Port allocation task failed"))
            })??;
        let credentials = match credentials::generate_credentials(&dashboard) {
            Ok(credentials) => credentials,
            Err(e) => {
                self.ports.release(ports.values());
                return Err(e);
            }
        };

        let now = Utc::now();
        let instance = Instance {
            docker: DockerArtifacts::for_instance(&id),
            id: id.clone(),
            name: name.to_string(),
            owner: owner
                .unwrap_or(self.config.provisioning.default_owner.as_str())
                .to_string(),
            status: InstanceStatus::Creating,
            ports,
            credentials,
            config,
            created_at: now,
            updated_at: now,
            error_message: None,
        };

        // Hold the per-id guard from before the record is visible, so any
        // later operation on this id queues behind provisioning.
        let guard = self.op_guard(&id).lock_owned().await;

        if let Err(e) = self.registry.lock().await.put(instance.clone()).await {
            self.ports.release(instance.ports.values());
            drop(guard);
            self.op_guards.remove(&id);
            return Err(InstanceError::Persistence(e));
        }

        tracing::info!(
            instance = %id,
            name = %instance.name,
            owner = %instance.owner,
            http_gateway = instance.ports.http_gateway,
            "Instance record created"
        );
        self.notifier.publish(StatusEvent::created(&instance));

        match self.config.provisioning.creation_mode {
            CreationMode::Async => {
                drop(lease);
                let manager = Arc::clone(self);
                let record = instance.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    // Failures are recorded on the instance and published.
                    let _ = manager.run_provisioning(record).await;
                });
                Ok(instance)
            }
            CreationMode::Sync => {
                let result = self.run_provisioning(instance).await;
                drop(guard);
                match result {
                    Ok(instance) => Ok(instance),
                    Err(e) => {
                        tracing::warn!(instance = %id, "Rolling back failed instance");
                        if let Err(rollback) = self.delete(&id).await {
                            tracing::error!(instance = %id, error = %rollback, "Rollback failed");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Checks that must pass before anything is allocated.
    async fn admit(&self, name: &str) -> InstanceResult<()> {
        if name.is_empty() {
            return Err(InstanceError::InvalidName("name must not be empty".to_string()));
        }
        if name.chars().count() > MAX_NAME_LENGTH {
            return Err(InstanceError::InvalidName(format!(
                "name must be at most {} characters",
                MAX_NAME_LENGTH
            )));
        }

        {
            let registry = self.registry.lock().await;
            if registry.find_by_name(name).is_some() {
                return Err(InstanceError::NameConflict {
                    name: name.to_string(),
                });
            }
            let max = self.config.provisioning.max_instances;
            if registry.len() >= max {
                return Err(InstanceError::CapacityReached { max });
            }
        }

        if !self.stack_dir().is_dir() {
            return Err(InstanceError::StackDirMissing {
                path: self.stack_dir().to_path_buf(),
            });
        }
        let script = self.config.provisioning.script_path();
        if !script.is_file() {
            return Err(InstanceError::ToolMissing { path: script });
        }
        if !self.runtime_available().await {
            return Err(InstanceError::RuntimeUnavailable);
        }

        let report = self.validator.validate_for_new_instance();
        if !report.can_create {
            tracing::warn!(issues = ?report.issues, "Host cannot admit a new instance");
            return Err(InstanceError::ResourceExhausted {
                issues: report.issues,
            });
        }
        Ok(())
    }

    async fn new_instance_id(&self) -> String {
        let registry = self.registry.lock().await;
        loop {
            let id = Uuid::new_v4().simple().to_string()[..ID_LENGTH].to_string();
            if !registry.contains(&id) {
                return id;
            }
        }
    }

    /// Drive the provisioning tail and record its outcome on the instance.
    async fn run_provisioning(&self, instance: Instance) -> InstanceResult<Instance> {
        let id = instance.id.clone();
        match self.provision(instance).await {
            Ok(instance) => {
                tracing::info!(instance = %id, "Instance is running");
                Ok(instance)
            }
            Err(e) => {
                tracing::error!(
                    instance = %id,
                    error = %e,
                    suggestion = %e.suggestion(),
                    "Provisioning failed"
                );
                if let Err(persist) = self
                    .set_status(&id, InstanceStatus::Error, Some(e.to_string()))
                    .await
                {
                    tracing::error!(instance = %id, error = %persist, "Failed to record provisioning error");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, instance: Instance) -> InstanceResult<Instance> {
        let cfg = &self.config.provisioning;
        self.set_status(&instance.id, InstanceStatus::Downloading, None)
            .await?;

        let policy = RetryPolicy::new(
            cfg.retry_attempts,
            Duration::from_secs(cfg.retry_base_delay_secs),
        );
        let provisioner = &self.provisioner;
        let record = &instance;
        let generate = retry_with_backoff(
            policy,
            "provisioning script",
            move |_| provisioner.generate(record),
            |_| true,
        );

        match tokio::time::timeout(cfg.script_timeout(), generate).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(InstanceError::provisioning(e)),
            Err(_) => {
                return Err(InstanceError::Timeout {
                    operation: "provisioning script".to_string(),
                    secs: cfg.script_timeout_secs,
                })
            }
        }

        for path in [
            instance.docker.env_path(self.stack_dir()),
            instance.docker.compose_path(self.stack_dir()),
        ] {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(InstanceError::ArtifactMissing { path });
            }
        }

        self.set_status(&instance.id, InstanceStatus::Starting, None)
            .await?;

        let ready = self
            .liveness
            .wait_until_ready(
                instance.ports.http_gateway,
                cfg.readiness_interval(),
                cfg.readiness_timeout(),
            )
            .await;
        if !ready {
            tracing::warn!(
                instance = %instance.id,
                port = instance.ports.http_gateway,
                timeout_secs = cfg.readiness_timeout_secs,
                "Gateway did not answer in time, marking running anyway"
            );
        }

        self.set_status(&instance.id, InstanceStatus::Running, None)
            .await?
            .ok_or_else(|| InstanceError::InstanceNotFound {
                id: instance.id.clone(),
            })
    }

    /// Persist a status change and publish it when the status moved.
    async fn set_status(
        &self,
        id: &str,
        status: InstanceStatus,
        error: Option<String>,
    ) -> InstanceResult<Option<Instance>> {
        let mut previous = None;
        let updated = self
            .registry
            .lock()
            .await
            .update(id, |instance| {
                previous = Some(instance.transition(status, error));
            })
            .await
            .map_err(InstanceError::Persistence)?;

        if let (Some(instance), Some(previous)) = (&updated, previous) {
            if previous != status {
                tracing::debug!(instance = %id, from = %previous, to = %status, "Status changed");
                self.notifier
                    .publish(StatusEvent::status_changed(instance, previous));
            }
        }
        Ok(updated)
    }

    // --- lifecycle operations -------------------------------------------

    pub async fn get(&self, id: &str) -> InstanceResult<Instance> {
        self.registry
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| InstanceError::InstanceNotFound { id: id.to_string() })
    }

    fn ensure_artifacts(&self, instance: &Instance) -> InstanceResult<()> {
        let compose = instance.docker.compose_path(self.stack_dir());
        if !compose.exists() {
            return Err(InstanceError::ArtifactMissing { path: compose });
        }
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> InstanceResult<Instance> {
        let guard = self.op_guard(id);
        let _guard = guard.lock().await;

        let instance = self.get(id).await?;
        self.ensure_artifacts(&instance)?;

        tracing::info!(instance = %id, "Stopping instance");
        self.provisioner
            .down(&instance, false)
            .await
            .map_err(InstanceError::provisioning)?;

        self.set_status(id, InstanceStatus::Stopped, None)
            .await?
            .ok_or_else(|| InstanceError::InstanceNotFound { id: id.to_string() })
    }

    /// Restart already provisioned containers.
    pub async fn start(&self, id: &str) -> InstanceResult<Instance> {
        let guard = self.op_guard(id);
        let _guard = guard.lock().await;

        let instance = self.get(id).await?;
        self.ensure_artifacts(&instance)?;

        tracing::info!(instance = %id, "Starting instance");
        self.provisioner
            .up(&instance)
            .await
            .map_err(InstanceError::provisioning)?;

        self.set_status(id, InstanceStatus::Running, None)
            .await?
            .ok_or_else(|| InstanceError::InstanceNotFound { id: id.to_string() })
    }

    /// Tear an instance down. Every step but the registry removal is
    /// best-effort; failures are reported as warnings.
    pub async fn delete(&self, id: &str) -> InstanceResult<DeleteReport> {
        let guard = self.op_guard(id);
        let _guard = guard.lock().await;

        let instance = self.get(id).await?;
        let mut warnings = Vec::new();

        tracing::info!(instance = %id, name = %instance.name, "Deleting instance");
        if instance.docker.compose_path(self.stack_dir()).exists() {
            if let Err(e) = self.provisioner.down(&instance, true).await {
                tracing::warn!(instance = %id, error = %e, "Container teardown failed, continuing");
                warnings.push(format!("teardown failed: {:#}", e));
            }
        }

        for path in instance.docker.all_paths(self.stack_dir()) {
            if let Err(e) = remove_path(&path).await {
                tracing::warn!(instance = %id, path = %path.display(), error = %e, "Failed to remove artifact");
                warnings.push(format!("{}: {}", path.display(), e));
            }
        }

        self.registry
            .lock()
            .await
            .delete(id)
            .await
            .map_err(InstanceError::Persistence)?;
        self.ports.release(instance.ports.values());
        self.op_guards.remove(id);

        self.notifier.publish(StatusEvent::deleted(&instance));
        Ok(DeleteReport {
            id: instance.id,
            name: instance.name,
            warnings,
        })
    }

    pub async fn update_config(&self, id: &str, patch: Map<String, Value>) -> InstanceResult<Instance> {
        let guard = self.op_guard(id);
        let _guard = guard.lock().await;

        self.registry
            .lock()
            .await
            .update(id, |instance| {
                instance.config.extend(patch);
                instance.updated_at = Utc::now();
            })
            .await
            .map_err(InstanceError::Persistence)?
            .ok_or_else(|| InstanceError::InstanceNotFound { id: id.to_string() })
    }

    /// Replace the dashboard login of a running instance. The gateway
    /// container must be up; the env file is rewritten so the login survives
    /// the next restart.
    pub async fn update_credentials(
        &self,
        id: &str,
        username: &str,
        password: &str,
    ) -> InstanceResult<Instance> {
        let username = username.trim();
        if username.chars().count() < MIN_DASHBOARD_USERNAME {
            return Err(InstanceError::InvalidCredentials(format!(
                "username must be at least {} characters",
                MIN_DASHBOARD_USERNAME
            )));
        }
        if password.chars().count() < MIN_DASHBOARD_PASSWORD {
            return Err(InstanceError::InvalidCredentials(format!(
                "password must be at least {} characters",
                MIN_DASHBOARD_PASSWORD
            )));
        }

        let guard = self.op_guard(id);
        let _guard = guard.lock().await;

        let instance = self.get(id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(InstanceError::NotRunning {
                id: id.to_string(),
                status: instance.status,
            });
        }

        let container = self.config.runtime.gateway_container_name(id);
        let inspect_secs = self.config.monitor.inspect_timeout_secs;
        let inspected = tokio::time::timeout(
            Duration::from_secs(inspect_secs),
            self.prober.runtime().inspect(&container),
        )
        .await;
        match inspected {
            Ok(Ok(info)) if info.running => {}
            Ok(Ok(info)) => {
                return Err(InstanceError::provisioning(anyhow::anyhow!(
                    "Gateway container {} is {}",
                    container,
                    info.state
                )))
            }
            Ok(Err(e)) => {
                return Err(InstanceError::provisioning(
                    e.context(format!("Failed to inspect {}", container)),
                ))
            }
            Err(_) => {
                return Err(InstanceError::Timeout {
                    operation: "gateway container inspection".to_string(),
                    secs: inspect_secs,
                })
            }
        }

        let env_file = instance.docker.env_path(self.stack_dir());
        set_env_entries(
            &env_file,
            &[("DASHBOARD_USERNAME", username), ("DASHBOARD_PASSWORD", password)],
        )
        .await
        .map_err(InstanceError::provisioning)?;

        let updated = self
            .registry
            .lock()
            .await
            .update(id, |instance| {
                instance.credentials.dashboard_username = username.to_string();
                instance.credentials.dashboard_password = password.to_string();
                instance.updated_at = Utc::now();
            })
            .await
            .map_err(InstanceError::Persistence)?
            .ok_or_else(|| InstanceError::InstanceNotFound { id: id.to_string() })?;

        tracing::info!(instance = %id, username = %username, "Dashboard credentials changed");
        Ok(updated)
    }

    // --- status ---------------------------------------------------------

    /// Probe one instance and persist what was observed. Instances busy with
    /// provisioning or another operation report their stored status.
    pub async fn get_status(&self, id: &str) -> InstanceResult<InstanceStatus> {
        let instance = self.get(id).await?;
        match self.refresh_one(instance).await {
            Refresh::Probed { status, .. } | Refresh::Skipped(status) => Ok(status),
        }
    }

    async fn refresh_one(&self, instance: Instance) -> Refresh {
        // A provisioning tail holds the guard until it settles.
        let guard = self.op_guard(&instance.id);
        let Ok(_guard) = guard.try_lock() else {
            return Refresh::Skipped(instance.status);
        };

        let observed = self.prober.probe(&instance).await;
        if observed == instance.status {
            return Refresh::Probed {
                status: observed,
                changed: false,
            };
        }

        // A failed provisioning attempt stays for inspection until its
        // containers actually come up.
        let container_up = matches!(observed, InstanceStatus::Running | InstanceStatus::Starting);
        if holds_failure(&instance) && !container_up {
            return Refresh::Probed {
                status: instance.status,
                changed: false,
            };
        }

        let message = (observed == InstanceStatus::Error).then(|| INSPECTION_FAILED.to_string());
        match self.set_status(&instance.id, observed, message).await {
            Ok(Some(_)) => Refresh::Probed {
                status: observed,
                changed: true,
            },
            // Deleted while probing
            Ok(None) => Refresh::Skipped(observed),
            Err(e) => {
                tracing::warn!(instance = %instance.id, error = %e, "Failed to persist probed status");
                Refresh::Probed {
                    status: observed,
                    changed: false,
                }
            }
        }
    }

    /// Probe every instance once. Used by the periodic sweep and by `list`.
    pub async fn refresh_statuses(&self) -> SweepResult {
        let snapshot: Vec<Instance> = self.registry.lock().await.values().cloned().collect();
        let outcomes =
            futures::future::join_all(snapshot.into_iter().map(|i| self.refresh_one(i))).await;

        let mut result = SweepResult::default();
        for outcome in outcomes {
            match outcome {
                Refresh::Probed { changed, .. } => {
                    result.checked += 1;
                    if changed {
                        result.changed += 1;
                    }
                }
                Refresh::Skipped(_) => result.skipped += 1,
            }
        }
        result
    }

    /// All instances, freshly probed when the runtime is reachable and with
    /// their stored status otherwise.
    pub async fn list(&self) -> InstanceList {
        self.list_filtered(|_| true).await
    }

    /// Instances visible to `owner`; admins see everything.
    pub async fn list_for_owner(&self, owner: &str, is_admin: bool) -> InstanceList {
        self.list_filtered(|i| is_admin || i.owner == owner).await
    }

    async fn list_filtered(&self, visible: impl Fn(&Instance) -> bool) -> InstanceList {
        if self.runtime_available().await {
            self.refresh_statuses().await;
        } else {
            tracing::warn!("Container runtime unreachable, listing stored statuses");
        }

        let host = &self.config.server.external_host;
        let registry = self.registry.lock().await;
        let mut instances: Vec<InstanceView> = registry
            .values()
            .filter(|i| visible(i))
            .map(|instance| InstanceView {
                urls: instance.urls(host),
                instance: instance.clone(),
            })
            .collect();
        instances.sort_by(|a, b| a.instance.created_at.cmp(&b.instance.created_at));

        let count = |status: InstanceStatus| {
            instances
                .iter()
                .filter(|v| v.instance.status == status)
                .count()
        };
        let stats = InstanceStats {
            total: instances.len(),
            running: count(InstanceStatus::Running),
            stopped: count(InstanceStatus::Stopped),
            max_instances: self.config.provisioning.max_instances,
        };

        InstanceList { instances, stats }
    }

    // --- maintenance ----------------------------------------------------

    /// Drop records whose compose and env files are both gone.
    pub async fn cleanup_orphans(&self) -> InstanceResult<OrphanReport> {
        let candidates: Vec<Instance> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|i| {
                    !i.docker.compose_path(self.stack_dir()).exists()
                        && !i.docker.env_path(self.stack_dir()).exists()
                })
                .cloned()
                .collect()
        };

        let mut report = OrphanReport::default();
        for instance in candidates {
            let guard = self.op_guard(&instance.id);
            let Ok(held) = guard.try_lock() else {
                continue;
            };

            let removed = self
                .registry
                .lock()
                .await
                .delete(&instance.id)
                .await
                .map_err(InstanceError::Persistence)?;
            if removed.is_some() {
                self.ports.release(instance.ports.values());
                tracing::info!(instance = %instance.id, name = %instance.name, "Removed orphaned instance");
                self.notifier.publish(StatusEvent::deleted(&instance));
                report.removed.push(instance.id.clone());
            }
            drop(held);
            self.op_guards.remove(&instance.id);
        }
        Ok(report)
    }

    /// Drop every creation lock holder.
    pub fn clear_locks(&self) -> Vec<ClearedLock> {
        self.lock.clear_all()
    }

    pub fn check_resources(&self) -> AdmissionReport {
        self.validator.validate_for_new_instance()
    }
}

enum Refresh {
    Probed { status: InstanceStatus, changed: bool },
    Skipped(InstanceStatus),
}

fn holds_failure(instance: &Instance) -> bool {
    instance.status == InstanceStatus::Error
        && instance
            .error_message
            .as_deref()
            .is_some_and(|message| message != INSPECTION_FAILED)
}

/// Set `KEY=value` lines in an env file, replacing existing entries and
/// appending missing ones.
async fn set_env_entries(path: &Path, entries: &[(&str, &str)]) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut pending: Vec<&(&str, &str)> = entries.iter().collect();
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let key = line.split_once('=').map(|(k, _)| k.trim());
            match pending.iter().position(|(k, _)| Some(*k) == key) {
                Some(index) => {
                    let (k, v) = pending.remove(index);
                    format!("{}={}", k, v)
                }
                None => line.to_string(),
            }
        })
        .collect();
    lines.extend(pending.into_iter().map(|(k, v)| format!("{}={}", k, v)));

    let mut updated = lines.join("\n");
    updated.push('\n');
    tokio::fs::write(path, updated)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn take_string(config: &mut Map<String, Value>, key: &str) -> Option<String> {
    match config.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

async fn remove_path(path: &Path) -> anyhow::Result<()> {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::provisioner::fakes::FakeProvisioner;
    use super::resources::fakes::StaticHostProbe;
    use super::*;
    use crate::credentials::{verify_token, ANON_ROLE};
    use crate::registry::fixtures;
    use crate::runtime::fakes::FakeRuntime;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        manager: Arc<InstanceManager>,
        runtime: Arc<FakeRuntime>,
        provisioner: Arc<FakeProvisioner>,
        dir: TempDir,
    }

    impl Harness {
        fn stack_dir(&self) -> PathBuf {
            self.dir.path().join("stack")
        }
    }

    fn test_config(dir: &Path, mode: CreationMode) -> Config {
        let mut config = Config::default();
        config.server.data_dir = dir.join("data");
        config.provisioning.stack_dir = dir.join("stack");
        config.provisioning.creation_mode = mode;
        config.provisioning.retry_base_delay_secs = 0;
        config.provisioning.readiness_timeout_secs = 0;
        config.provisioning.readiness_interval_secs = 0;
        config.monitor.liveness_timeout_secs = 1;
        config
    }

    fn harness_with(
        mode: CreationMode,
        tweak: impl FnOnce(&mut Config),
        provisioner: impl FnOnce(&mut FakeProvisioner),
        probe: StaticHostProbe,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path(), mode);
        tweak(&mut config);

        std::fs::create_dir_all(&config.server.data_dir).unwrap();
        std::fs::create_dir_all(&config.provisioning.stack_dir).unwrap();
        std::fs::write(config.provisioning.script_path(), "#!/bin/bash\n").unwrap();

        let runtime = Arc::new(FakeRuntime::available());
        let mut fake = FakeProvisioner::new(&config.provisioning.stack_dir);
        provisioner(&mut fake);
        let provisioner = Arc::new(fake);

        let registry = Registry::new(config.server.registry_path());
        let manager = InstanceManager::new(
            config,
            registry,
            runtime.clone(),
            provisioner.clone(),
            Box::new(probe),
        )
        .unwrap();

        Harness {
            manager: Arc::new(manager),
            runtime,
            provisioner,
            dir,
        }
    }

    fn harness(mode: CreationMode) -> Harness {
        harness_with(mode, |_| {}, |_| {}, StaticHostProbe::healthy())
    }

    /// Wait until the background tail leaves the provisioning states.
    async fn settled(manager: &InstanceManager, id: &str) -> Instance {
        for _ in 0..500 {
            let instance = manager.get(id).await.unwrap();
            if !instance.status.is_provisioning() {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {} never settled", id);
    }

    #[tokio::test]
    async fn test_async_create_returns_creating_record() {
        let h = harness(CreationMode::Async);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Creating);
        assert_eq!(instance.id.len(), 8);
        assert_eq!(instance.owner, "admin");
        for (category, port) in instance.ports.entries() {
            assert!(h.manager.config().ports.range(category).contains(port));
        }
        let mut ports = instance.ports.values().to_vec();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);

        let claims = verify_token(&instance.credentials.anon_key, &instance.credentials.jwt_secret).unwrap();
        assert_eq!(claims.role, ANON_ROLE);

        let done = settled(&h.manager, &instance.id).await;
        assert_eq!(done.status, InstanceStatus::Running);
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn test_create_persists_before_returning() {
        let h = harness(CreationMode::Async);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let reloaded = Registry::load(h.manager.config().server.registry_path(), "admin")
            .await
            .unwrap();
        assert!(reloaded.contains(&instance.id));
        settled(&h.manager, &instance.id).await;
    }

    #[tokio::test]
    async fn test_status_events_follow_the_tail() {
        let h = harness(CreationMode::Async);
        let mut rx = h.manager.subscribe();
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let mut statuses = Vec::new();
        while statuses.last() != Some(&InstanceStatus::Running) {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.instance_id, instance.id);
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                InstanceStatus::Creating,
                InstanceStatus::Downloading,
                InstanceStatus::Starting,
                InstanceStatus::Running
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_instances_have_disjoint_ports() {
        let h = harness(CreationMode::Sync);
        let a = h.manager.create("alpha", Map::new()).await.unwrap();
        let b = h.manager.create("beta", Map::new()).await.unwrap();

        for port in a.ports.values() {
            assert!(!b.ports.values().contains(&port));
        }
    }

    #[tokio::test]
    async fn test_second_create_while_locked_is_busy() {
        let h = harness(CreationMode::Async);
        let _held = h.manager.lock.try_acquire("other-attempt").unwrap();

        match h.manager.create("demo", Map::new()).await {
            Err(InstanceError::LockBusy { wait_seconds }) => assert!(wait_seconds > 0),
            other => panic!("expected LockBusy, got {:?}", other.map(|i| i.id)),
        }
        assert!(h.manager.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let h = harness_with(
            CreationMode::Async,
            |_| {},
            |p| p.generate_delay = Duration::from_millis(200),
            StaticHostProbe::healthy(),
        );
        let first = h.manager.create("demo", Map::new()).await.unwrap();

        let err = h.manager.create("  DEMO ", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::NameConflict { .. }));
        assert_eq!(h.manager.registry.lock().await.len(), 1);
        settled(&h.manager, &first.id).await;
    }

    #[tokio::test]
    async fn test_empty_name_is_invalid() {
        let h = harness(CreationMode::Async);
        let err = h.manager.create("   ", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidName(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_resource_rejection_allocates_nothing() {
        let mut probe = StaticHostProbe::healthy();
        probe.memory = Some(MemoryStats {
            total_mb: 1024,
            available_mb: 100,
            percentage: 90,
        });
        probe.cpu = Some(CpuStats { load: 99, cores: 1 });
        let h = harness_with(CreationMode::Async, |_| {}, |_| {}, probe);

        match h.manager.create("demo", Map::new()).await {
            Err(InstanceError::ResourceExhausted { issues }) => assert_eq!(issues.len(), 2),
            other => panic!("expected ResourceExhausted, got {:?}", other.map(|i| i.id)),
        }
        assert_eq!(h.manager.ports.reserved_count(), 0);
        assert!(h.manager.registry.lock().await.is_empty());
        assert!(!h.manager.config().server.registry_path().exists());
        assert_eq!(h.manager.lock.active_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let h = harness_with(
            CreationMode::Sync,
            |c| c.provisioning.max_instances = 1,
            |_| {},
            StaticHostProbe::healthy(),
        );
        h.manager.create("one", Map::new()).await.unwrap();
        let err = h.manager.create("two", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::CapacityReached { max: 1 }));
    }

    #[tokio::test]
    async fn test_missing_script_is_fatal() {
        let h = harness(CreationMode::Async);
        std::fs::remove_file(h.manager.config().provisioning.script_path()).unwrap();

        let err = h.manager.create("demo", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::ToolMissing { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_runtime_blocks_creation() {
        let h = harness(CreationMode::Async);
        *h.runtime.available.lock() = false;

        let err = h.manager.create("demo", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::RuntimeUnavailable));
        assert_eq!(h.manager.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_script_retries_then_succeeds() {
        let h = harness_with(
            CreationMode::Sync,
            |_| {},
            |p| *p.fail_generate.lock() = 2,
            StaticHostProbe::healthy(),
        );
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        let generates = h
            .provisioner
            .calls()
            .iter()
            .filter(|c| c.starts_with("generate:"))
            .count();
        assert_eq!(generates, 3);
    }

    #[tokio::test]
    async fn test_sync_failure_rolls_back() {
        let h = harness_with(
            CreationMode::Sync,
            |_| {},
            |p| *p.fail_generate.lock() = 3,
            StaticHostProbe::healthy(),
        );
        let mut rx = h.manager.subscribe();

        let err = h.manager.create("demo", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::ProvisioningFailed { .. }));
        assert!(err.is_transient());

        assert!(h.manager.registry.lock().await.is_empty());
        assert_eq!(h.manager.ports.reserved_count(), 0);
        assert_eq!(h.manager.lock.active_count(), 0);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if event.status == InstanceStatus::Error {
                assert!(event.message.is_some());
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_async_failure_keeps_errored_record() {
        let h = harness_with(
            CreationMode::Async,
            |_| {},
            |p| *p.fail_generate.lock() = 3,
            StaticHostProbe::healthy(),
        );
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let done = settled(&h.manager, &instance.id).await;
        assert_eq!(done.status, InstanceStatus::Error);
        assert!(done.error_message.unwrap().contains("script exited"));
        assert_eq!(h.manager.lock.active_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail_despite_success_exit() {
        let h = harness_with(
            CreationMode::Async,
            |_| {},
            |p| p.write_artifacts = false,
            StaticHostProbe::healthy(),
        );
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let done = settled(&h.manager, &instance.id).await;
        assert_eq!(done.status, InstanceStatus::Error);
        assert!(done.error_message.unwrap().contains(".env-"));
    }

    #[tokio::test]
    async fn test_script_budget_marks_error() {
        let h = harness_with(
            CreationMode::Sync,
            |c| c.provisioning.script_timeout_secs = 1,
            |p| p.generate_delay = Duration::from_secs(3),
            StaticHostProbe::healthy(),
        );

        let err = h.manager.create("demo", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::Timeout { secs: 1, .. }));
        assert!(h.manager.registry.lock().await.is_empty());
        assert_eq!(h.manager.lock.active_count(), 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_not_fatal() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_dashboard_overrides_move_into_credentials() {
        let h = harness(CreationMode::Sync);
        let config = json!({
            "organization": "Acme",
            "dashboard_username": "ops",
            "dashboard_password": "s3cret-pass",
        });
        let Value::Object(config) = config else { unreachable!() };

        let instance = h.manager.create_as(Some("bob"), "demo", config).await.unwrap();
        assert_eq!(instance.owner, "bob");
        assert_eq!(instance.credentials.dashboard_username, "ops");
        assert_eq!(instance.credentials.dashboard_password, "s3cret-pass");
        assert_eq!(instance.config.get("organization"), Some(&json!("Acme")));
        assert!(!instance.config.contains_key("dashboard_password"));
    }

    #[tokio::test]
    async fn test_delete_releases_ports_and_files() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        let compose = instance.docker.compose_path(&h.stack_dir());
        assert!(compose.exists());

        let report = h.manager.delete(&instance.id).await.unwrap();
        assert!(report.warnings.is_empty());
        assert!(matches!(
            h.manager.get(&instance.id).await,
            Err(InstanceError::InstanceNotFound { .. })
        ));
        for port in instance.ports.values() {
            assert!(!h.manager.ports.is_reserved(port));
        }
        for path in instance.docker.all_paths(&h.stack_dir()) {
            assert!(!path.exists(), "{} left behind", path.display());
        }
        assert!(h
            .provisioner
            .calls()
            .contains(&format!("down:{}:true", instance.id)));
    }

    #[tokio::test]
    async fn test_delete_survives_teardown_failure() {
        let h = harness_with(
            CreationMode::Sync,
            |_| {},
            |p| p.fail_down = true,
            StaticHostProbe::healthy(),
        );
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let report = h.manager.delete(&instance.id).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.message().contains("warning"));
        assert!(h.manager.get(&instance.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let h = harness(CreationMode::Sync);
        let err = h.manager.delete("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_stop_and_start() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let stopped = h.manager.stop(&instance.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        let started = h.manager.start(&instance.id).await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);

        let calls = h.provisioner.calls();
        assert!(calls.contains(&format!("down:{}:false", instance.id)));
        assert!(calls.contains(&format!("up:{}", instance.id)));
    }

    #[tokio::test]
    async fn test_stop_without_artifacts_is_fatal() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        std::fs::remove_file(instance.docker.compose_path(&h.stack_dir())).unwrap();

        let err = h.manager.stop(&instance.id).await.unwrap_err();
        assert!(matches!(err, InstanceError::ArtifactMissing { .. }));
    }

    #[tokio::test]
    async fn test_list_refreshes_when_runtime_is_up() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        // No container exists in the fake runtime.
        let list = h.manager.list().await;
        assert_eq!(list.stats.total, 1);
        assert_eq!(list.instances[0].instance.status, InstanceStatus::Stopped);
        assert_eq!(list.stats.stopped, 1);
        assert_eq!(list.stats.max_instances, 50);
        assert!(list.instances[0]
            .urls
            .api
            .ends_with(&format!(":{}", instance.ports.http_gateway)));
        assert_eq!(h.manager.get(&instance.id).await.unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_list_uses_stored_status_when_runtime_down() {
        let h = harness(CreationMode::Sync);
        h.manager.create("demo", Map::new()).await.unwrap();
        *h.runtime.available.lock() = false;

        let list = h.manager.list().await;
        assert_eq!(list.instances[0].instance.status, InstanceStatus::Running);
        assert_eq!(list.stats.running, 1);
    }

    #[tokio::test]
    async fn test_list_for_owner() {
        let h = harness(CreationMode::Sync);
        h.manager.create_as(Some("alice"), "a", Map::new()).await.unwrap();
        h.manager.create_as(Some("bob"), "b", Map::new()).await.unwrap();
        *h.runtime.available.lock() = false;

        assert_eq!(h.manager.list_for_owner("alice", false).await.stats.total, 1);
        assert_eq!(h.manager.list_for_owner("alice", true).await.stats.total, 2);
        assert_eq!(h.manager.list_for_owner("carol", false).await.stats.total, 0);
    }

    #[tokio::test]
    async fn test_get_status_persists_observation() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        h.runtime
            .set_container(&format!("stack-studio-{}", instance.id), true);

        // Running container, gateway closed: starting.
        let status = h.manager.get_status(&instance.id).await.unwrap();
        assert_eq!(status, InstanceStatus::Starting);
        assert_eq!(h.manager.get(&instance.id).await.unwrap().status, InstanceStatus::Starting);

        *h.runtime.fail_listing.lock() = true;
        assert_eq!(h.manager.get_status(&instance.id).await.unwrap(), InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_instances() {
        let h = harness(CreationMode::Sync);
        let mut busy = fixtures::instance("ab12cd34", "busy", 9100);
        busy.status = InstanceStatus::Downloading;
        h.manager.registry.lock().await.put(busy).await.unwrap();
        let guard = h.manager.op_guard("ab12cd34");
        let _held = guard.lock().await;

        let result = h.manager.refresh_statuses().await;
        assert_eq!(result.skipped, 1);
        assert_eq!(result.checked, 0);
        assert_eq!(
            h.manager.get("ab12cd34").await.unwrap().status,
            InstanceStatus::Downloading
        );
    }

    #[tokio::test]
    async fn test_recover_interrupted_marks_error() {
        let h = harness(CreationMode::Sync);
        let mut stuck = fixtures::instance("ab12cd34", "stuck", 9100);
        stuck.status = InstanceStatus::Creating;
        h.manager.registry.lock().await.put(stuck).await.unwrap();

        assert_eq!(h.manager.recover_interrupted().await.unwrap(), 1);
        let recovered = h.manager.get("ab12cd34").await.unwrap();
        assert_eq!(recovered.status, InstanceStatus::Error);
        assert!(recovered.error_message.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_orphans() {
        let h = harness(CreationMode::Sync);
        let kept = h.manager.create("kept", Map::new()).await.unwrap();
        let orphan = fixtures::instance("deadbeef", "orphan", 9100);
        h.manager.registry.lock().await.put(orphan).await.unwrap();

        let report = h.manager.cleanup_orphans().await.unwrap();
        assert_eq!(report.removed, vec!["deadbeef".to_string()]);
        assert!(h.manager.get(&kept.id).await.is_ok());
        assert!(h.manager.get("deadbeef").await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_merges() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let mut patch = Map::new();
        patch.insert("organization".to_string(), json!("Initech"));
        let updated = h.manager.update_config(&instance.id, patch).await.unwrap();
        assert_eq!(updated.config.get("organization"), Some(&json!("Initech")));
        assert!(updated.updated_at >= instance.updated_at);

        assert!(h.manager.update_config("missing", Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_locks_reports_holders() {
        let h = harness(CreationMode::Sync);
        std::mem::forget(h.manager.lock.try_acquire("wedged").unwrap());

        let cleared = h.manager.clear_locks();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].token, "wedged");
        assert!(h.manager.create("demo", Map::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_no_record() {
        let h = harness(CreationMode::Sync);
        let data_dir = h.manager.config().server.data_dir.clone();
        std::fs::remove_dir_all(&data_dir).unwrap();

        let err = h.manager.create("demo", Map::new()).await.unwrap_err();
        assert!(matches!(err, InstanceError::Persistence(_)));
        assert!(h.manager.registry.lock().await.is_empty());
        assert_eq!(h.manager.ports.reserved_count(), 0);
        assert_eq!(h.manager.lock.active_count(), 0);
        assert!(h.manager.op_guards.is_empty());

        // The name is free again once the disk is back.
        std::fs::create_dir_all(&data_dir).unwrap();
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_delete_keeps_ports_when_persist_fails() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        std::fs::remove_dir_all(&h.manager.config().server.data_dir).unwrap();

        let err = h.manager.delete(&instance.id).await.unwrap_err();
        assert!(matches!(err, InstanceError::Persistence(_)));
        assert!(h.manager.get(&instance.id).await.is_ok());
        for port in instance.ports.values() {
            assert!(h.manager.ports.is_reserved(port));
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_provisioning_failure() {
        let h = harness_with(
            CreationMode::Async,
            |_| {},
            |p| *p.fail_generate.lock() = 3,
            StaticHostProbe::healthy(),
        );
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        let failed = settled(&h.manager, &instance.id).await;
        assert_eq!(failed.status, InstanceStatus::Error);

        // No container exists, which alone would read as stopped.
        let result = h.manager.refresh_statuses().await;
        assert_eq!(result.changed, 0);
        let kept = h.manager.get(&instance.id).await.unwrap();
        assert_eq!(kept.status, InstanceStatus::Error);
        assert_eq!(kept.error_message, failed.error_message);

        let reloaded = Registry::load(h.manager.config().server.registry_path(), "admin")
            .await
            .unwrap();
        assert_eq!(reloaded.get(&instance.id).unwrap().status, InstanceStatus::Error);

        // Containers brought up by hand do replace the failure.
        h.runtime
            .set_container(&format!("stack-studio-{}", instance.id), true);
        assert_eq!(
            h.manager.get_status(&instance.id).await.unwrap(),
            InstanceStatus::Starting
        );
        assert!(h.manager.get(&instance.id).await.unwrap().error_message.is_none());
    }

    #[tokio::test]
    async fn test_inspection_error_clears_once_runtime_answers() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        let container = format!("stack-studio-{}", instance.id);

        *h.runtime.fail_listing.lock() = true;
        assert_eq!(h.manager.get_status(&instance.id).await.unwrap(), InstanceStatus::Error);

        *h.runtime.fail_listing.lock() = false;
        h.runtime.set_container(&container, true);
        assert_eq!(h.manager.get_status(&instance.id).await.unwrap(), InstanceStatus::Starting);

        h.runtime.remove_container(&container);
        assert_eq!(h.manager.get_status(&instance.id).await.unwrap(), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_update_credentials_rewrites_login() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();
        h.runtime
            .set_container(&format!("stack-kong-{}", instance.id), true);
        let env_file = instance.docker.env_path(&h.stack_dir());
        std::fs::write(&env_file, "X=1\nDASHBOARD_USERNAME=admin\n").unwrap();

        let updated = h
            .manager
            .update_credentials(&instance.id, "  ops ", "hunter22")
            .await
            .unwrap();
        assert_eq!(updated.credentials.dashboard_username, "ops");
        assert_eq!(updated.credentials.dashboard_password, "hunter22");
        assert_eq!(updated.credentials.jwt_secret, instance.credentials.jwt_secret);

        let env = std::fs::read_to_string(&env_file).unwrap();
        assert_eq!(env, "X=1\nDASHBOARD_USERNAME=ops\nDASHBOARD_PASSWORD=hunter22\n");

        let reloaded = Registry::load(h.manager.config().server.registry_path(), "admin")
            .await
            .unwrap();
        assert_eq!(
            reloaded.get(&instance.id).unwrap().credentials.dashboard_username,
            "ops"
        );
    }

    #[tokio::test]
    async fn test_update_credentials_validates_input() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        let err = h
            .manager
            .update_credentials(&instance.id, " ab ", "hunter22")
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidCredentials(_)));
        assert_eq!(err.status_code(), 400);

        let err = h
            .manager
            .update_credentials(&instance.id, "ops", "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidCredentials(_)));

        let err = h
            .manager
            .update_credentials("missing", "ops", "hunter22")
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_credentials_requires_running_gateway() {
        let h = harness(CreationMode::Sync);
        let instance = h.manager.create("demo", Map::new()).await.unwrap();

        // Gateway container absent.
        let err = h
            .manager
            .update_credentials(&instance.id, "ops", "hunter22")
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::ProvisioningFailed { .. }));

        h.runtime
            .set_container(&format!("stack-kong-{}", instance.id), false);
        assert!(h
            .manager
            .update_credentials(&instance.id, "ops", "hunter22")
            .await
            .is_err());

        h.manager.stop(&instance.id).await.unwrap();
        let err = h
            .manager
            .update_credentials(&instance.id, "ops", "hunter22")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstanceError::NotRunning {
                status: InstanceStatus::Stopped,
                ..
            }
        ));

        let unchanged = h.manager.get(&instance.id).await.unwrap();
        assert_eq!(
            unchanged.credentials.dashboard_username,
            instance.credentials.dashboard_username
        );
    }

    #[tokio::test]
    async fn test_set_env_entries_appends_missing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env-ab12cd34");
        std::fs::write(&path, "A=1\nB=2").unwrap();

        set_env_entries(&path, &[("B", "3"), ("C", "4")]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "A=1\nB=3\nC=4\n");

        assert!(set_env_entries(&dir.path().join("missing"), &[("A", "1")])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ports_of_loaded_instances_stay_reserved() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), CreationMode::Sync);
        let mut registry = Registry::new(dir.path().join("instances.json"));
        registry
            .put(fixtures::instance("ab12cd34", "existing", 8150))
            .await
            .unwrap();

        let manager = InstanceManager::new(
            config,
            registry,
            Arc::new(FakeRuntime::available()),
            Arc::new(FakeProvisioner::new(dir.path())),
            Box::new(StaticHostProbe::healthy()),
        )
        .unwrap();
        assert!(manager.ports.is_reserved(8150));
        assert!(manager.ports.is_reserved(8154));
    }
}
