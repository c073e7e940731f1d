use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::registry::PortCategory;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub resources: ResourceThresholds,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// File name of the instance registry inside `data_dir`
    #[serde(default = "default_registry_file")]
    pub registry_file: String,
    /// Host name or IP used when building instance URLs
    #[serde(default = "default_external_host")]
    pub external_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            registry_file: default_registry_file(),
            external_host: default_external_host(),
        }
    }
}

impl ServerConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(&self.registry_file)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_registry_file() -> String {
    "instances.json".to_string()
}

fn default_external_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_type")]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    /// Name of the container whose state stands for the whole stack.
    /// `{id}` is replaced with the instance id.
    #[serde(default = "default_probe_container")]
    pub probe_container: String,
    /// Name of the API gateway container, which serves the dashboard login
    #[serde(default = "default_gateway_container")]
    pub gateway_container: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            docker_socket: default_docker_socket(),
            probe_container: default_probe_container(),
            gateway_container: default_gateway_container(),
        }
    }
}

impl RuntimeConfig {
    pub fn probe_container_name(&self, instance_id: &str) -> String {
        self.probe_container.replace("{id}", instance_id)
    }

    pub fn gateway_container_name(&self, instance_id: &str) -> String {
        self.gateway_container.replace("{id}", instance_id)
    }
}

fn default_runtime_type() -> RuntimeType {
    RuntimeType::Auto
}

fn default_docker_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "/var/run/docker.sock".to_string()
    }
}

fn default_probe_container() -> String {
    "stack-studio-{id}".to_string()
}

fn default_gateway_container() -> String {
    "stack-kong-{id}".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Auto,
    Docker,
    /// Run without a container runtime (status probing reports last-known state)
    None,
}

/// Whether `create` waits for the provisioning tail to finish.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CreationMode {
    /// Return after the record is persisted; errored records stay for inspection
    #[default]
    Async,
    /// Return after provisioning finishes; failures roll the instance back
    Sync,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Directory holding the provisioning script and generated artifacts
    #[serde(default = "default_stack_dir")]
    pub stack_dir: PathBuf,
    /// Script file name, relative to `stack_dir`
    #[serde(default = "default_generate_script")]
    pub generate_script: String,
    #[serde(default)]
    pub creation_mode: CreationMode,
    /// Budget for the whole script phase, retries included
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_compose_timeout")]
    pub compose_timeout_secs: u64,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_secs: u64,
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Owner assigned to records that predate ownership tracking
    #[serde(default = "default_owner")]
    pub default_owner: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            stack_dir: default_stack_dir(),
            generate_script: default_generate_script(),
            creation_mode: CreationMode::default(),
            script_timeout_secs: default_script_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay(),
            compose_timeout_secs: default_compose_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_secs: default_readiness_interval(),
            liveness_path: default_liveness_path(),
            max_instances: default_max_instances(),
            default_owner: default_owner(),
        }
    }
}

impl ProvisioningConfig {
    pub fn script_path(&self) -> PathBuf {
        self.stack_dir.join(&self.generate_script)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn compose_timeout(&self) -> Duration {
        Duration::from_secs(self.compose_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }
}

fn default_stack_dir() -> PathBuf {
    PathBuf::from("./stack")
}

fn default_generate_script() -> String {
    "generate.bash".to_string()
}

fn default_script_timeout() -> u64 {
    900
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    10
}

fn default_compose_timeout() -> u64 {
    600
}

fn default_readiness_timeout() -> u64 {
    300
}

fn default_readiness_interval() -> u64 {
    5
}

fn default_liveness_path() -> String {
    "/api/health".to_string()
}

fn default_max_instances() -> usize {
    50
}

fn default_owner() -> String {
    "admin".to_string()
}

/// Inclusive port range for one category
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_http_gateway_range")]
    pub http_gateway: PortRange,
    #[serde(default = "default_https_gateway_range")]
    pub https_gateway: PortRange,
    #[serde(default = "default_db_external_range")]
    pub db_external: PortRange,
    #[serde(default = "default_pooler_range")]
    pub pooler: PortRange,
    #[serde(default = "default_analytics_range")]
    pub analytics: PortRange,
    /// Random samples per category before giving up
    #[serde(default = "default_port_attempts")]
    pub max_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            http_gateway: default_http_gateway_range(),
            https_gateway: default_https_gateway_range(),
            db_external: default_db_external_range(),
            pooler: default_pooler_range(),
            analytics: default_analytics_range(),
            max_attempts: default_port_attempts(),
        }
    }
}

impl PortsConfig {
    pub fn range(&self, category: PortCategory) -> PortRange {
        match category {
            PortCategory::HttpGateway => self.http_gateway,
            PortCategory::HttpsGateway => self.https_gateway,
            PortCategory::DbExternal => self.db_external,
            PortCategory::Pooler => self.pooler,
            PortCategory::Analytics => self.analytics,
        }
    }
}

fn default_http_gateway_range() -> PortRange {
    PortRange::new(8100, 8199)
}

fn default_https_gateway_range() -> PortRange {
    PortRange::new(8400, 8499)
}

fn default_db_external_range() -> PortRange {
    PortRange::new(5500, 5599)
}

fn default_pooler_range() -> PortRange {
    PortRange::new(6500, 6599)
}

fn default_analytics_range() -> PortRange {
    PortRange::new(4100, 4199)
}

fn default_port_attempts() -> u32 {
    100
}

/// Minimum host capacity required to admit a new instance
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
    #[serde(default = "default_min_disk_gb")]
    pub min_disk_gb: u64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: u8,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            min_memory_mb: default_min_memory_mb(),
            min_disk_gb: default_min_disk_gb(),
            max_cpu_percent: default_max_cpu_percent(),
        }
    }
}

fn default_min_memory_mb() -> u64 {
    512
}

fn default_min_disk_gb() -> u64 {
    2
}

fn default_max_cpu_percent() -> u8 {
    80
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Creation locks older than this are treated as abandoned
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_stale_after() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_inspect_timeout")]
    pub inspect_timeout_secs: u64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval(),
            inspect_timeout_secs: default_inspect_timeout(),
            liveness_timeout_secs: default_liveness_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_inspect_timeout() -> u64 {
    10
}

fn default_liveness_timeout() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            provisioning: ProvisioningConfig::default(),
            ports: PortsConfig::default(),
            resources: ResourceThresholds::default(),
            lock: LockConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse configuration file: {}", path.display()))?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject port layouts that could hand the same port to two categories.
    pub fn validate(&self) -> Result<()> {
        for category in PortCategory::ALL {
            let range = self.ports.range(category);
            if range.min == 0 || range.min > range.max {
                anyhow::bail!(
                    "Invalid port range for {}: {}-{}",
                    category,
                    range.min,
                    range.max
                );
            }
        }

        for (i, a) in PortCategory::ALL.iter().enumerate() {
            for b in &PortCategory::ALL[i + 1..] {
                if self.ports.range(*a).overlaps(&self.ports.range(*b)) {
                    anyhow::bail!("Port ranges for {} and {} overlap", a, b);
                }
            }
        }

        if self.provisioning.retry_attempts == 0 {
            anyhow::bail!("provisioning.retry_attempts must be at least 1");
        }

        Ok(())
    }
}
