//! Startup self-checks module
//!
//! This module verifies the host before the manager starts serving requests.
//! Checks include:
//! - Data directory exists and is writable
//! - Stack directory and provisioning script are present
//! - Container runtime availability
//! - Sufficient disk space for new instances

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::disk_stats_for_path;
use crate::runtime::ContainerRuntime;

/// Result of a single startup check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Whether this check is critical (failure should abort startup)
    pub critical: bool,
    /// Human-readable message describing the result
    pub message: String,
    /// Additional details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Aggregated startup check results
#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    /// All check results
    pub checks: Vec<CheckResult>,
    /// Whether all critical checks passed
    pub all_critical_passed: bool,
    /// Whether all checks passed (including non-critical)
    pub all_passed: bool,
    /// Summary message
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);

        let failed_critical = checks
            .iter()
            .filter(|c| c.critical && !c.passed)
            .count();
        let failed_non_critical = checks
            .iter()
            .filter(|c| !c.critical && !c.passed)
            .count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} non-critical warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

/// Run all startup self-checks
pub async fn run_startup_checks(config: &Config, runtime: &dyn ContainerRuntime) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let checks = vec![
        check_data_directory(config),
        check_directory_writability(config),
        check_stack_directory(config),
        check_provisioning_script(config),
        check_container_runtime(runtime).await,
        check_disk_space(&config.provisioning.stack_dir, config.resources.min_disk_gb),
    ];

    let report = StartupCheckReport::new(checks);

    // Log results
    for check in &report.checks {
        if check.passed {
            info!(
                check = %check.name,
                message = %check.message,
                "Startup check PASSED"
            );
        } else if check.critical {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (non-critical)"
            );
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Startup checks completed"
    );

    report
}

fn check_data_directory(config: &Config) -> CheckResult {
    let data_dir = &config.server.data_dir;
    if data_dir.is_dir() {
        CheckResult::pass("data_directory", "Data directory exists")
            .with_details(format!("Path: {}", data_dir.display()))
    } else {
        CheckResult::fail("data_directory", "Data directory is missing", true)
            .with_details(format!("Missing: {}", data_dir.display()))
    }
}

/// Check that the registry can be written
fn check_directory_writability(config: &Config) -> CheckResult {
    let data_dir = &config.server.data_dir;
    let test_file = data_dir.join(".stackyard_write_test");

    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass("directory_writability", "Data directory is writable")
                .with_details(format!("Path: {}", data_dir.display()))
        }
        Err(e) => CheckResult::fail(
            "directory_writability",
            "Data directory is not writable",
            true,
        )
        .with_details(format!("{}: {}", data_dir.display(), e)),
    }
}

// Without the stack directory or script, existing instances can still be
// listed, stopped and deleted; only creation fails.
fn check_stack_directory(config: &Config) -> CheckResult {
    let stack_dir = &config.provisioning.stack_dir;
    if stack_dir.is_dir() {
        CheckResult::pass("stack_directory", "Stack directory exists")
            .with_details(format!("Path: {}", stack_dir.display()))
    } else {
        CheckResult::fail("stack_directory", "Stack directory not found", false)
            .with_details(format!("Missing: {}", stack_dir.display()))
    }
}

fn check_provisioning_script(config: &Config) -> CheckResult {
    let script = config.provisioning.script_path();
    if script.is_file() {
        CheckResult::pass("provisioning_script", "Provisioning script found")
            .with_details(format!("Path: {}", script.display()))
    } else {
        CheckResult::fail(
            "provisioning_script",
            "Provisioning script not found",
            false,
        )
        .with_details(format!("Missing: {}", script.display()))
    }
}

async fn check_container_runtime(runtime: &dyn ContainerRuntime) -> CheckResult {
    if runtime.is_available().await {
        CheckResult::pass(
            "container_runtime",
            format!("{} runtime available", runtime.name()),
        )
    } else {
        CheckResult::fail(
            "container_runtime",
            "No container runtime available",
            false, // Non-critical: stored instances stay readable
        )
        .with_details("Start Docker to enable provisioning and status probing")
    }
}

/// Check available disk space against the admission threshold
fn check_disk_space(path: &Path, min_gb: u64) -> CheckResult {
    match disk_stats_for_path(path) {
        Ok(stats) if stats.available_gb >= min_gb => CheckResult::pass(
            "disk_space",
            format!("Sufficient disk space ({} GB free)", stats.available_gb),
        )
        .with_details(format!(
            "Usage: {}% of {} GB",
            stats.percentage, stats.total_gb
        )),
        Ok(stats) => CheckResult::fail(
            "disk_space",
            format!(
                "Low disk space ({} GB free, minimum {} GB required)",
                stats.available_gb, min_gb
            ),
            false,
        )
        .with_details(format!("Usage: {}%", stats.percentage)),
        Err(e) => CheckResult::fail("disk_space", "Failed to check disk space", false)
            .with_details(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_pass() {
        let result = CheckResult::pass("test", "Test passed");
        assert!(result.passed);
        assert!(!result.critical);
        assert_eq!(result.name, "test");
    }

    #[test]
    fn test_check_result_fail() {
        let result = CheckResult::fail("test", "Test failed", true);
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[test]
    fn test_startup_check_report_all_passed() {
        let checks = vec![
            CheckResult::pass("check1", "ok"),
            CheckResult::pass("check2", "ok"),
        ];
        let report = StartupCheckReport::new(checks);
        assert!(report.all_passed);
        assert!(report.all_critical_passed);
    }

    #[test]
    fn test_startup_check_report_critical_failure() {
        let checks = vec![
            CheckResult::pass("check1", "ok"),
            CheckResult::fail("check2", "fail", true),
        ];
        let report = StartupCheckReport::new(checks);
        assert!(!report.all_passed);
        assert!(!report.all_critical_passed);
    }

    #[test]
    fn test_startup_check_report_non_critical_failure() {
        let checks = vec![
            CheckResult::pass("check1", "ok"),
            CheckResult::fail("check2", "warn", false),
        ];
        let report = StartupCheckReport::new(checks);
        assert!(!report.all_passed);
        assert!(report.all_critical_passed); // Non-critical failures don't affect this
    }

    #[tokio::test]
    async fn test_checks_on_prepared_host() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.data_dir = dir.path().join("data");
        config.provisioning.stack_dir = dir.path().join("stack");
        config.resources.min_disk_gb = 0;
        std::fs::create_dir_all(&config.server.data_dir).unwrap();
        std::fs::create_dir_all(&config.provisioning.stack_dir).unwrap();
        std::fs::write(config.provisioning.script_path(), "exit 0\n").unwrap();

        let report = run_startup_checks(&config, &crate::runtime::NoopRuntime).await;
        assert!(report.all_critical_passed);
        assert!(!report.all_passed);
        let runtime = report
            .checks
            .iter()
            .find(|c| c.name == "container_runtime")
            .unwrap();
        assert!(!runtime.passed);
        assert!(!runtime.critical);
    }

    #[tokio::test]
    async fn test_missing_data_dir_is_critical() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.data_dir = dir.path().join("absent");
        config.provisioning.stack_dir = dir.path().to_path_buf();

        let report = run_startup_checks(&config, &crate::runtime::NoopRuntime).await;
        assert!(!report.all_critical_passed);
        let script = report
            .checks
            .iter()
            .find(|c| c.name == "provisioning_script")
            .unwrap();
        assert!(!script.passed);
    }
}
