//! CLI module for the stackyard command-line interface.
//!
//! Without a subcommand (or with `run`) the binary starts the daemon, which
//! sweeps instance statuses in the background. The other subcommands are
//! one-shot operator commands working on the same registry:
//! - `create <name>` - Provision a new instance and wait for it to settle
//! - `list` / `show <id>` - Inspect instances
//! - `stop <id>` / `start <id>` / `delete <id>` - Lifecycle operations
//! - `status <id>` - Probe one instance
//! - `cleanup-orphans` - Drop records whose generated files are gone
//! - `resources` - Show host capacity against admission thresholds
//! - `config check` - Validate configuration file
//!
//! The daemon owns the registry while it runs. Commands that write to it
//! refuse to run next to a daemon; `list` and `show` fall back to a
//! read-only snapshot.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::engine::{InstanceManager, ResourceValidator, SystemHostProbe};
use crate::error::InstanceError;
use crate::notifications::EventKind;
use crate::registry::{Instance, InstanceStatus, Registry};
use crate::runtime::detect_runtime;

const PID_FILE: &str = "stackyard.pid";

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "stackyard")]
#[command(author, version, about = "Provision and supervise isolated backend stacks", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "STACKYARD_CONFIG", default_value = "stackyard.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Skip startup self-checks (for development only)
    #[arg(long)]
    pub skip_checks: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to run (if none, starts the daemon)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon (default)
    Run,

    /// Provision a new instance
    Create {
        /// Display name, unique among instances
        name: String,
        /// Owner recorded on the instance (defaults to provisioning.default_owner)
        #[arg(long)]
        owner: Option<String>,
        /// Organization passed to the provisioning script
        #[arg(long)]
        organization: Option<String>,
        /// Dashboard login name (default: admin)
        #[arg(long)]
        dashboard_user: Option<String>,
        /// Dashboard password (default: random)
        #[arg(long)]
        dashboard_password: Option<String>,
        /// Extra config entry, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
    },

    /// List instances
    List {
        /// Only show instances of this owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show details for an instance
    Show {
        id: String,
        /// Include credentials in the output
        #[arg(long)]
        secrets: bool,
    },

    /// Stop an instance's containers
    Stop { id: String },

    /// Start a stopped instance
    Start { id: String },

    /// Change the dashboard login of a running instance
    SetCredentials {
        id: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "STACKYARD_DASHBOARD_PASSWORD")]
        password: String,
    },

    /// Tear an instance down and remove its files
    Delete { id: String },

    /// Probe an instance's current status
    Status { id: String },

    /// Remove records whose compose and env files are both missing
    CleanupOrphans,

    /// Show host resources against the admission thresholds
    Resources,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err("config key must not be empty".to_string());
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Run a one-shot CLI command. `Run` and no command are handled in main.rs.
pub async fn run_command(cli: &Cli, config: Config) -> Result<()> {
    match &cli.command {
        Some(Commands::Create {
            name,
            owner,
            organization,
            dashboard_user,
            dashboard_password,
            set,
        }) => {
            let mut extra = Map::new();
            for (key, value) in set {
                extra.insert(key.clone(), Value::String(value.clone()));
            }
            let optional = [
                ("organization", organization),
                ("dashboard_username", dashboard_user),
                ("dashboard_password", dashboard_password),
            ];
            for (key, value) in optional {
                if let Some(value) = value {
                    extra.insert(key.to_string(), Value::String(value.clone()));
                }
            }
            cmd_create(cli, config, name, owner.as_deref(), extra).await
        }
        Some(Commands::List { owner }) => cmd_list(cli, config, owner.as_deref()).await,
        Some(Commands::Show { id, secrets }) => cmd_show(cli, config, id, *secrets).await,
        Some(Commands::Stop { id }) => {
            let manager = open_manager(config).await?;
            let instance = manager.stop(id).await.map_err(explain)?;
            print_result(cli, &instance, || println!("[OK] Instance '{}' stopped", instance.name))
        }
        Some(Commands::Start { id }) => {
            let manager = open_manager(config).await?;
            let instance = manager.start(id).await.map_err(explain)?;
            print_result(cli, &instance, || println!("[OK] Instance '{}' started", instance.name))
        }
        Some(Commands::SetCredentials {
            id,
            username,
            password,
        }) => {
            let manager = open_manager(config).await?;
            let instance = manager
                .update_credentials(id, username, password)
                .await
                .map_err(explain)?;
            print_result(cli, &instance, || {
                println!(
                    "[OK] Dashboard login of '{}' is now '{}'",
                    instance.name, instance.credentials.dashboard_username
                )
            })
        }
        Some(Commands::Delete { id }) => {
            let manager = open_manager(config).await?;
            let report = manager.delete(id).await.map_err(explain)?;
            print_result(cli, &report, || println!("[OK] {}", report.message()))
        }
        Some(Commands::Status { id }) => {
            let manager = open_manager(config).await?;
            let status = manager.get_status(id).await.map_err(explain)?;
            print_result(cli, &status, || println!("{}: {}", id, status))
        }
        Some(Commands::CleanupOrphans) => {
            let manager = open_manager(config).await?;
            let report = manager.cleanup_orphans().await.map_err(explain)?;
            print_result(cli, &report, || {
                if report.removed.is_empty() {
                    println!("No orphaned instances found.");
                } else {
                    println!("Removed {} orphaned instance(s):", report.removed.len());
                    for id in &report.removed {
                        println!("  {}", id);
                    }
                }
            })
        }
        Some(Commands::Resources) => cmd_resources(cli, &config),
        Some(Commands::Config(ConfigCommands::Check)) => cmd_config_check(cli),
        Some(Commands::Run) | None => Ok(()),
    }
}

/// Attach the remediation hint to an orchestrator error.
fn explain(e: InstanceError) -> anyhow::Error {
    let hint = e.suggestion();
    anyhow::Error::new(e).context(format!("hint: {}", hint))
}

fn print_result<T: Serialize>(cli: &Cli, value: &T, human: impl FnOnce()) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

/// Open the manager for a command that writes to the registry.
async fn open_manager(config: Config) -> Result<Arc<InstanceManager>> {
    if let Some(pid) = running_daemon(&config.server.data_dir) {
        anyhow::bail!(
            "The stackyard daemon (pid {}) owns the registry; stop it before running this command",
            pid
        );
    }
    let runtime = detect_runtime(&config.runtime).await?;
    Ok(Arc::new(InstanceManager::from_config(config, runtime).await?))
}

/// Load the registry without touching it, for reads next to a running daemon.
async fn registry_snapshot(config: &Config) -> Result<Registry> {
    Registry::load(
        config.server.registry_path(),
        &config.provisioning.default_owner,
    )
    .await
}

async fn cmd_create(
    cli: &Cli,
    config: Config,
    name: &str,
    owner: Option<&str>,
    extra: Map<String, Value>,
) -> Result<()> {
    let manager = open_manager(config).await?;
    let mut events = manager.subscribe();

    if !cli.json {
        println!("Creating instance '{}'...", name);
    }
    let created = manager.create_as(owner, name, extra).await.map_err(explain)?;

    // In async mode the tail runs in the background; this process must stay
    // alive until it settles.
    let mut status = created.status;
    while status.is_provisioning() {
        match events.recv().await {
            Ok(event) if event.instance_id == created.id => {
                if !cli.json {
                    println!("  {} -> {}", event.previous.map(|p| p.as_str()).unwrap_or("-"), event.status);
                }
                if event.kind == EventKind::Deleted {
                    break;
                }
                status = event.status;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                status = manager.get(&created.id).await.map_err(explain)?.status;
            }
            Err(RecvError::Closed) => break,
        }
    }

    let instance = manager.get(&created.id).await.map_err(explain)?;
    if instance.status == InstanceStatus::Error {
        anyhow::bail!(
            "Instance '{}' ({}) failed: {}",
            instance.name,
            instance.id,
            instance.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let host = manager.config().server.external_host.clone();
    print_instance(cli, &instance, &host, true)
}

async fn cmd_list(cli: &Cli, config: Config, owner: Option<&str>) -> Result<()> {
    let list = if running_daemon(&config.server.data_dir).is_some() {
        let max_instances = config.provisioning.max_instances;
        let host = config.server.external_host.clone();
        let registry = registry_snapshot(&config).await?;
        let instances: Vec<_> = registry
            .values()
            .filter(|i| owner.map_or(true, |o| i.owner == o))
            .map(|instance| crate::engine::InstanceView {
                urls: instance.urls(&host),
                instance: instance.clone(),
            })
            .collect();
        let count = |status: InstanceStatus| instances.iter().filter(|v| v.instance.status == status).count();
        crate::engine::InstanceList {
            stats: crate::engine::InstanceStats {
                total: instances.len(),
                running: count(InstanceStatus::Running),
                stopped: count(InstanceStatus::Stopped),
                max_instances,
            },
            instances,
        }
    } else {
        let manager = open_manager(config).await?;
        match owner {
            Some(owner) => manager.list_for_owner(owner, false).await,
            None => manager.list().await,
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.instances.is_empty() {
        println!("No instances found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<10}  {:<20}  {:<12}  {:<12}  {:<8}  {:<20}",
        "ID", "NAME", "OWNER", "STATUS", "GATEWAY", "CREATED"
    );
    println!("{}", "-".repeat(92));

    for view in &list.instances {
        let instance = &view.instance;
        println!(
            "{:<10}  {:<20}  {:<12}  {:<12}  {:<8}  {:<20}",
            instance.id,
            truncate(&instance.name, 20),
            truncate(&instance.owner, 12),
            instance.status,
            instance.ports.http_gateway,
            instance.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!();
    println!(
        "{} instance(s): {} running, {} stopped (limit {})",
        list.stats.total, list.stats.running, list.stats.stopped, list.stats.max_instances
    );
    Ok(())
}

async fn cmd_show(cli: &Cli, config: Config, id: &str, secrets: bool) -> Result<()> {
    let host = config.server.external_host.clone();
    let registry = registry_snapshot(&config).await?;
    let instance = registry
        .get(id)
        .cloned()
        .ok_or_else(|| explain(InstanceError::InstanceNotFound { id: id.to_string() }))?;
    print_instance(cli, &instance, &host, secrets)
}

fn print_instance(cli: &Cli, instance: &Instance, host: &str, secrets: bool) -> Result<()> {
    let urls = instance.urls(host);

    if cli.json {
        let mut value = serde_json::to_value(instance)?;
        if let Value::Object(map) = &mut value {
            map.insert("urls".to_string(), serde_json::to_value(&urls)?);
            if !secrets {
                map.remove("credentials");
            }
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("=== Instance: {} ===", instance.name);
    println!();
    println!("ID:          {}", instance.id);
    println!("Owner:       {}", instance.owner);
    println!("Status:      {}", instance.status);
    if let Some(error) = &instance.error_message {
        println!("Error:       {}", error);
    }
    println!("Created:     {}", instance.created_at);
    println!("Updated:     {}", instance.updated_at);
    println!();
    println!("Ports:");
    for (category, port) in instance.ports.entries() {
        println!("  {:<14} {}", category.as_str(), port);
    }
    println!();
    println!("URLs:");
    println!("  Studio:      {}", urls.studio);
    println!("  API:         {}", urls.api);
    if secrets {
        println!("  Database:    {}", urls.db);
        println!();
        println!("Credentials:");
        let creds = &instance.credentials;
        println!("  Dashboard:   {} / {}", creds.dashboard_username, creds.dashboard_password);
        println!("  Anon key:    {}", creds.anon_key);
        println!("  Service key: {}", creds.service_role_key);
    }
    println!();
    Ok(())
}

fn cmd_resources(cli: &Cli, config: &Config) -> Result<()> {
    let validator = ResourceValidator::new(
        Box::new(SystemHostProbe::new(&config.provisioning.stack_dir)),
        config.resources.clone(),
    );
    let report = validator.validate_for_new_instance();

    print_result(cli, &report, || {
        let r = &report.resources;
        println!();
        println!("=== Host Resources ===");
        println!();
        println!(
            "Memory:  {} MB available of {} MB ({}% used)",
            r.memory.available_mb, r.memory.total_mb, r.memory.percentage
        );
        println!(
            "Disk:    {} GB available of {} GB ({}% used)",
            r.disk.available_gb, r.disk.total_gb, r.disk.percentage
        );
        println!("CPU:     {}% load on {} core(s)", r.cpu.load, r.cpu.cores);
        println!();
        if report.can_create {
            println!("[OK] A new instance can be admitted");
        } else {
            println!("[!!] A new instance would be rejected:");
            for issue in &report.issues {
                println!("  - {}", issue);
            }
        }
        println!();
    })
}

fn cmd_config_check(cli: &Cli) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!(
            "[!!] Configuration file not found: {}",
            config_path.display()
        );
        println!();
        println!("A default configuration will be used when starting the daemon.");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            println!("[OK] Configuration file is valid!");
            println!();
            println!("=== Configuration Summary ===");
            println!();
            println!("Server:");
            println!("  Data Dir:     {}", config.server.data_dir.display());
            println!("  Registry:     {}", config.server.registry_path().display());
            println!("  External Host: {}", config.server.external_host);
            println!();
            println!("Runtime:");
            println!("  Type:         {:?}", config.runtime.runtime_type);
            println!("  Docker Socket: {}", config.runtime.docker_socket);
            println!();
            println!("Provisioning:");
            println!("  Stack Dir:    {}", config.provisioning.stack_dir.display());
            println!("  Script:       {}", config.provisioning.script_path().display());
            println!("  Mode:         {:?}", config.provisioning.creation_mode);
            println!("  Max Instances: {}", config.provisioning.max_instances);
            println!();
            println!("Ports:");
            for category in crate::registry::PortCategory::ALL {
                let range = config.ports.range(category);
                println!("  {:<14} {}-{}", category.as_str(), range.min, range.max);
            }
            println!();
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] Configuration file is invalid!");
            println!();
            println!("Error: {:#}", e);
            anyhow::bail!("Configuration validation failed")
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

// ============================================================================
// Daemon pid file
// ============================================================================

/// Marks the data directory as owned by a running daemon. Removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        if let Some(pid) = running_daemon(data_dir) {
            anyhow::bail!("Another stackyard daemon is already running (pid {})", pid);
        }
        let path = data_dir.join(PID_FILE);
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write pid file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pid of a live daemon owning `data_dir`, if any. Stale pid files are ignored.
pub fn running_daemon(data_dir: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(data_dir.join(PID_FILE)).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    (pid != std::process::id() && process_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
