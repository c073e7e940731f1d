//! Error taxonomy surfaced by the instance manager.
//!
//! Every failure that crosses the orchestrator boundary is one of these
//! variants. Callers map them to responses via [`InstanceError::status_code`],
//! decide whether retrying is worthwhile via [`InstanceError::is_transient`],
//! and show [`InstanceError::suggestion`] to the user.

use std::path::PathBuf;
use thiserror::Error;

use crate::registry::{InstanceStatus, PortCategory};

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Invalid instance name: {0}")]
    InvalidName(String),

    #[error("An instance named '{name}' already exists")]
    NameConflict { name: String },

    #[error("Maximum of {max} instances reached")]
    CapacityReached { max: usize },

    #[error("Insufficient host resources: {}", issues.join("; "))]
    ResourceExhausted { issues: Vec<String> },

    #[error("No free port available for {category}")]
    PortExhaustion { category: PortCategory },

    #[error("Generated {role} token failed verification")]
    TokenVerificationFailed {
        role: String,
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    #[error("Another instance creation has been running for {wait_seconds}s")]
    LockBusy { wait_seconds: u64 },

    #[error("Container runtime is not available")]
    RuntimeUnavailable,

    #[error("Provisioning script not found: {}", path.display())]
    ToolMissing { path: PathBuf },

    #[error("Stack directory not found: {}", path.display())]
    StackDirMissing { path: PathBuf },

    #[error("Provisioning failed: {cause}")]
    ProvisioningFailed {
        cause: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Expected artifact is missing: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    #[error("Invalid dashboard credentials: {0}")]
    InvalidCredentials(String),

    #[error("Instance {id} is {status}, expected running")]
    NotRunning { id: String, status: InstanceStatus },

    #[error("Failed to persist instance registry")]
    Persistence(#[source] anyhow::Error),
}

impl InstanceError {
    pub fn provisioning(cause: anyhow::Error) -> Self {
        InstanceError::ProvisioningFailed {
            cause: format!("{:#}", cause),
            source: Some(cause),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstanceError::LockBusy { .. }
                | InstanceError::PortExhaustion { .. }
                | InstanceError::ResourceExhausted { .. }
                | InstanceError::RuntimeUnavailable
                | InstanceError::Timeout { .. }
                | InstanceError::ProvisioningFailed { .. }
        )
    }

    /// Remediation hint shown alongside the error message.
    pub fn suggestion(&self) -> String {
        match self {
            InstanceError::InvalidName(_) => "Provide a non-empty instance name".to_string(),
            InstanceError::NameConflict { .. } => "Choose a different instance name".to_string(),
            InstanceError::CapacityReached { .. } => {
                "Delete unused instances before creating new ones".to_string()
            }
            InstanceError::ResourceExhausted { .. } => {
                "Free memory or disk space on the host, or wait for CPU load to drop".to_string()
            }
            InstanceError::PortExhaustion { category } => format!(
                "Release ports in the {} range or widen it in the configuration",
                category
            ),
            InstanceError::TokenVerificationFailed { .. } => {
                "Retry the creation; the generated signing secret was unusable".to_string()
            }
            InstanceError::LockBusy { .. } => {
                "Wait for the running creation to finish, then retry".to_string()
            }
            InstanceError::RuntimeUnavailable => {
                "Start the Docker daemon and make sure its socket is reachable".to_string()
            }
            InstanceError::ToolMissing { .. } | InstanceError::StackDirMissing { .. } => {
                "Check provisioning.stack_dir and provisioning.generate_script".to_string()
            }
            InstanceError::ProvisioningFailed { .. } => {
                "Inspect the provisioning output in the logs; the first run may need to download images"
                    .to_string()
            }
            InstanceError::Timeout { .. } => {
                "Retry later or check network connectivity to the image registry".to_string()
            }
            InstanceError::ArtifactMissing { .. } => {
                "Re-create the instance; its generated files are gone".to_string()
            }
            InstanceError::InstanceNotFound { .. } => "Check the instance id".to_string(),
            InstanceError::InvalidCredentials(_) => {
                "Use a username of at least 3 and a password of at least 4 characters".to_string()
            }
            InstanceError::NotRunning { .. } => "Start the instance, then retry".to_string(),
            InstanceError::Persistence(_) => {
                "Check that the data directory is writable and not full".to_string()
            }
        }
    }

    /// HTTP-style status for the routing layer.
    pub fn status_code(&self) -> u16 {
        match self {
            InstanceError::InvalidName(_) | InstanceError::InvalidCredentials(_) => 400,
            InstanceError::InstanceNotFound { .. } => 404,
            InstanceError::NameConflict { .. }
            | InstanceError::LockBusy { .. }
            | InstanceError::NotRunning { .. } => 409,
            InstanceError::ArtifactMissing { .. } => 410,
            InstanceError::CapacityReached { .. } => 422,
            InstanceError::ResourceExhausted { .. }
            | InstanceError::PortExhaustion { .. }
            | InstanceError::RuntimeUnavailable => 503,
            InstanceError::Timeout { .. } => 504,
            InstanceError::ProvisioningFailed { .. } => 502,
            InstanceError::TokenVerificationFailed { .. }
            | InstanceError::ToolMissing { .. }
            | InstanceError::StackDirMissing { .. }
            | InstanceError::Persistence(_) => 500,
        }
    }
}

pub type InstanceResult<T> = std::result::Result<T, InstanceError>;
