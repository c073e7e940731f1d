//! Instance record types persisted in the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Downloading,
    Starting,
    Running,
    Stopped,
    Error,
    Unavailable,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Downloading => "downloading",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Unavailable => "unavailable",
        }
    }

    /// True while a provisioning attempt owns the record.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Creating | InstanceStatus::Downloading | InstanceStatus::Starting
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named port categories, each drawn from its own disjoint range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortCategory {
    HttpGateway,
    HttpsGateway,
    DbExternal,
    Pooler,
    Analytics,
}

impl PortCategory {
    pub const ALL: [PortCategory; 5] = [
        PortCategory::HttpGateway,
        PortCategory::HttpsGateway,
        PortCategory::DbExternal,
        PortCategory::Pooler,
        PortCategory::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortCategory::HttpGateway => "http_gateway",
            PortCategory::HttpsGateway => "https_gateway",
            PortCategory::DbExternal => "db_external",
            PortCategory::Pooler => "pooler",
            PortCategory::Analytics => "analytics",
        }
    }
}

impl fmt::Display for PortCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePorts {
    pub http_gateway: u16,
    pub https_gateway: u16,
    pub db_external: u16,
    pub pooler: u16,
    pub analytics: u16,
}

impl InstancePorts {
    pub fn get(&self, category: PortCategory) -> u16 {
        match category {
            PortCategory::HttpGateway => self.http_gateway,
            PortCategory::HttpsGateway => self.https_gateway,
            PortCategory::DbExternal => self.db_external,
            PortCategory::Pooler => self.pooler,
            PortCategory::Analytics => self.analytics,
        }
    }

    pub fn values(&self) -> [u16; 5] {
        PortCategory::ALL.map(|category| self.get(category))
    }

    pub fn entries(&self) -> [(PortCategory, u16); 5] {
        PortCategory::ALL.map(|category| (category, self.get(category)))
    }
}

/// Secrets minted for an instance at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub db_password: String,
    pub jwt_secret: String,
    /// Read-only role token signed with `jwt_secret`
    pub anon_key: String,
    /// Privileged role token signed with `jwt_secret`
    pub service_role_key: String,
    pub dashboard_username: String,
    pub dashboard_password: String,
    pub vault_enc_key: String,
    pub analytics_api_key: String,
}

/// Provisioning artifact names, relative to the stack directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerArtifacts {
    pub compose_file: String,
    pub env_file: String,
    pub volumes_dir: String,
}

impl DockerArtifacts {
    pub fn for_instance(id: &str) -> Self {
        Self {
            compose_file: format!("docker-compose-{}.yml", id),
            env_file: format!(".env-{}", id),
            volumes_dir: format!("volumes-{}", id),
        }
    }

    pub fn compose_path(&self, stack_dir: &Path) -> PathBuf {
        stack_dir.join(&self.compose_file)
    }

    pub fn env_path(&self, stack_dir: &Path) -> PathBuf {
        stack_dir.join(&self.env_file)
    }

    pub fn volumes_path(&self, stack_dir: &Path) -> PathBuf {
        stack_dir.join(&self.volumes_dir)
    }

    pub fn all_paths(&self, stack_dir: &Path) -> [PathBuf; 3] {
        [
            self.compose_path(stack_dir),
            self.env_path(stack_dir),
            self.volumes_path(stack_dir),
        ]
    }
}

/// URLs derived from an instance's id and ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceUrls {
    pub studio: String,
    pub api: String,
    pub db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// Empty for records written before ownership was tracked
    #[serde(default)]
    pub owner: String,
    pub status: InstanceStatus,
    pub ports: InstancePorts,
    pub credentials: Credentials,
    pub docker: DockerArtifacts,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Instance {
    /// Move to `status`, returning the previous one.
    ///
    /// `error_message` is only kept for the `error` status.
    pub fn transition(&mut self, status: InstanceStatus, error: Option<String>) -> InstanceStatus {
        let previous = self.status;
        self.status = status;
        self.error_message = if status == InstanceStatus::Error {
            error.or_else(|| Some("unknown error".to_string()))
        } else {
            None
        };
        self.updated_at = Utc::now();
        previous
    }

    pub fn urls(&self, external_host: &str) -> InstanceUrls {
        let gateway = format!("http://{}:{}", external_host, self.ports.http_gateway);
        InstanceUrls {
            studio: gateway.clone(),
            api: gateway,
            db: format!(
                "postgresql://postgres:{}@{}:{}/postgres",
                self.credentials.db_password, external_host, self.ports.db_external
            ),
        }
    }
}
