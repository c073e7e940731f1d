//! Drives the external provisioning tool and `docker compose`.
//!
//! The generate script materializes an instance's compose file, env file and
//! volumes directory inside the stack directory, then brings the stack up.
//! Stop/start/teardown go through compose against the generated file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::registry::Instance;

/// Prefix of every variable handed to the generate script.
pub const ENV_PREFIX: &str = "STACKYARD_";

const DEFAULT_ORGANIZATION: &str = "Default Organization";

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Run the generate script once for `instance`.
    async fn generate(&self, instance: &Instance) -> Result<()>;
    /// Start the instance's already generated containers.
    async fn up(&self, instance: &Instance) -> Result<()>;
    /// Stop the instance's containers, optionally dropping their volumes.
    async fn down(&self, instance: &Instance, remove_volumes: bool) -> Result<()>;
}

pub struct ComposeProvisioner {
    stack_dir: PathBuf,
    script: PathBuf,
    external_host: String,
    compose_timeout: Duration,
}

impl ComposeProvisioner {
    pub fn new(
        stack_dir: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        external_host: impl Into<String>,
        compose_timeout: Duration,
    ) -> Self {
        Self {
            stack_dir: stack_dir.into(),
            script: script.into(),
            external_host: external_host.into(),
            compose_timeout,
        }
    }

    /// Arguments following `docker compose`. The instance's own env file is
    /// passed explicitly so compose never falls back to the shared `.env`.
    fn compose_args(&self, instance: &Instance, args: &[&str]) -> Vec<OsString> {
        let mut full: Vec<OsString> = vec![
            "-f".into(),
            instance.docker.compose_path(&self.stack_dir).into_os_string(),
            "--env-file".into(),
            instance.docker.env_path(&self.stack_dir).into_os_string(),
        ];
        full.extend(args.iter().map(OsString::from));
        full
    }

    async fn compose(&self, instance: &Instance, args: &[&str]) -> Result<()> {
        let full_args = self.compose_args(instance, args);
        let run = run_compose_command(&self.stack_dir, &full_args);

        match tokio::time::timeout(self.compose_timeout, run).await {
            Ok(result) => result.with_context(|| {
                format!("docker compose {} failed for instance {}", args.join(" "), instance.id)
            }),
            Err(_) => anyhow::bail!(
                "docker compose {} timed out after {}s",
                args.join(" "),
                self.compose_timeout.as_secs()
            ),
        }
    }
}

#[async_trait]
impl Provisioner for ComposeProvisioner {
    async fn generate(&self, instance: &Instance) -> Result<()> {
        tracing::info!(
            instance = %instance.id,
            script = %self.script.display(),
            dir = %self.stack_dir.display(),
            "Running provisioning script"
        );

        let output = Command::new("bash")
            .arg(&self.script)
            .current_dir(&self.stack_dir)
            .envs(script_env(instance, &self.external_host))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.script.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            tracing::debug!(instance = %instance.id, output = %tail(&stdout), "Provisioning script output");
        }

        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.script.display(),
                output.status,
                tail(&stderr)
            );
        }

        if !stderr.trim().is_empty() {
            tracing::warn!(instance = %instance.id, stderr = %tail(&stderr), "Provisioning script wrote to stderr");
        }
        Ok(())
    }

    async fn up(&self, instance: &Instance) -> Result<()> {
        self.compose(instance, &["up", "-d"]).await
    }

    async fn down(&self, instance: &Instance, remove_volumes: bool) -> Result<()> {
        if remove_volumes {
            self.compose(instance, &["down", "-v", "--remove-orphans"]).await
        } else {
            self.compose(instance, &["down"]).await
        }
    }
}

/// Environment describing `instance` to the generate script.
pub fn script_env(instance: &Instance, external_host: &str) -> Vec<(String, String)> {
    let organization = instance
        .config
        .get("organization")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_ORGANIZATION);
    let creds = &instance.credentials;
    let ports = &instance.ports;

    [
        ("INSTANCE_ID", instance.id.clone()),
        ("PROJECT_NAME", instance.name.clone()),
        ("ORGANIZATION_NAME", organization.to_string()),
        ("DB_PASSWORD", creds.db_password.clone()),
        ("JWT_SECRET", creds.jwt_secret.clone()),
        ("ANON_KEY", creds.anon_key.clone()),
        ("SERVICE_ROLE_KEY", creds.service_role_key.clone()),
        ("DASHBOARD_USERNAME", creds.dashboard_username.clone()),
        ("DASHBOARD_PASSWORD", creds.dashboard_password.clone()),
        ("VAULT_ENC_KEY", creds.vault_enc_key.clone()),
        ("ANALYTICS_API_KEY", creds.analytics_api_key.clone()),
        ("GATEWAY_HTTP_PORT", ports.http_gateway.to_string()),
        ("GATEWAY_HTTPS_PORT", ports.https_gateway.to_string()),
        ("DB_PORT_EXT", ports.db_external.to_string()),
        ("POOLER_PORT_EXT", ports.pooler.to_string()),
        ("ANALYTICS_PORT", ports.analytics.to_string()),
        ("EXTERNAL_IP", external_host.to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (format!("{}{}", ENV_PREFIX, key), value))
    .collect()
}

/// Run docker compose with `args`, falling back to the legacy
/// `docker-compose` binary when `docker` cannot be spawned.
async fn run_compose_command(project_dir: &Path, args: &[OsString]) -> Result<()> {
    let result = Command::new("docker")
        .arg("compose")
        .args(args)
        .current_dir(project_dir)
        .kill_on_drop(true)
        .output()
        .await;

    let output = match result {
        Ok(output) => output,
        Err(_) => Command::new("docker-compose")
            .args(args)
            .current_dir(project_dir)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute docker-compose")?,
    };

    check_output(output)
}

fn check_output(output: Output) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("{}", tail(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Last few lines of process output, enough for an error message.
fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(10);
    lines[start..].join("\n")
}
