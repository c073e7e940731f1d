//! Host resource checks used to admit new instances.
//!
//! Memory and CPU load come from `/proc`, disk space from `statvfs` on the
//! stack directory. Any probe that fails falls back to a fixed snapshot so
//! the check itself never errors.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::ResourceThresholds;

const GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_mb: u64,
    pub available_mb: u64,
    pub percentage: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiskStats {
    pub total_gb: u64,
    pub available_gb: u64,
    pub percentage: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuStats {
    /// Recent load as a percentage of all cores
    pub load: u8,
    pub cores: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory: MemoryStats,
    pub disk: DiskStats,
    pub cpu: CpuStats,
}

impl ResourceSnapshot {
    /// Used when the host cannot be inspected.
    pub const FALLBACK: ResourceSnapshot = ResourceSnapshot {
        memory: MemoryStats {
            total_mb: 2048,
            available_mb: 1024,
            percentage: 50,
        },
        disk: DiskStats {
            total_gb: 20,
            available_gb: 10,
            percentage: 50,
        },
        cpu: CpuStats { load: 25, cores: 1 },
    };
}

/// Source of host resource figures.
pub trait HostProbe: Send + Sync {
    fn memory(&self) -> Result<MemoryStats>;
    fn disk(&self) -> Result<DiskStats>;
    fn cpu(&self) -> Result<CpuStats>;
}

/// Reads the live host.
pub struct SystemHostProbe {
    disk_path: PathBuf,
}

impl SystemHostProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }
}

impl HostProbe for SystemHostProbe {
    fn memory(&self) -> Result<MemoryStats> {
        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        parse_meminfo(&meminfo)
    }

    fn disk(&self) -> Result<DiskStats> {
        disk_stats_for_path(&self.disk_path)
    }

    fn cpu(&self) -> Result<CpuStats> {
        let loadavg =
            std::fs::read_to_string("/proc/loadavg").context("Failed to read /proc/loadavg")?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        parse_loadavg(&loadavg, cores)
    }
}

fn percent(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 / whole as f64) * 100.0).round().min(100.0) as u8
}

fn meminfo_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

fn parse_meminfo(content: &str) -> Result<MemoryStats> {
    let total_kb = meminfo_kb(content, "MemTotal:").context("MemTotal missing")?;
    let available_kb = meminfo_kb(content, "MemAvailable:")
        .or_else(|| meminfo_kb(content, "MemFree:"))
        .context("MemAvailable missing")?;

    let total_mb = total_kb / 1024;
    let available_mb = available_kb / 1024;
    Ok(MemoryStats {
        total_mb,
        available_mb,
        percentage: percent(total_mb.saturating_sub(available_mb), total_mb),
    })
}

fn parse_loadavg(content: &str, cores: usize) -> Result<CpuStats> {
    let one_minute: f64 = content
        .split_whitespace()
        .next()
        .context("Empty loadavg")?
        .parse()
        .context("Invalid loadavg")?;

    let cores = cores.max(1);
    let load = ((one_minute / cores as f64) * 100.0).round().clamp(0.0, 100.0) as u8;
    Ok(CpuStats { load, cores })
}

/// Disk figures for the filesystem holding `path`.
pub fn disk_stats_for_path(path: &Path) -> Result<DiskStats> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();

        let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if result != 0 {
            return Err(anyhow::anyhow!(
                "Failed to get disk stats for {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            ));
        }

        let stat = unsafe { stat.assume_init() };

        let block_size = stat.f_frsize as u64;
        let total_bytes = stat.f_blocks as u64 * block_size;
        // f_bavail excludes blocks reserved for root
        let available_bytes = stat.f_bavail as u64 * block_size;

        Ok(DiskStats {
            total_gb: total_bytes / GB,
            available_gb: available_bytes / GB,
            percentage: percent(total_bytes.saturating_sub(available_bytes), total_bytes),
        })
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Disk stats are not supported for {}", path.display())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReport {
    pub can_create: bool,
    pub issues: Vec<String>,
    pub resources: ResourceSnapshot,
}

pub struct ResourceValidator {
    probe: Box<dyn HostProbe>,
    thresholds: ResourceThresholds,
}

impl ResourceValidator {
    pub fn new(probe: Box<dyn HostProbe>, thresholds: ResourceThresholds) -> Self {
        Self { probe, thresholds }
    }

    /// Current host figures. Never fails: each figure that cannot be read
    /// is replaced by the fallback snapshot's value.
    pub fn check_resources(&self) -> ResourceSnapshot {
        let fallback = ResourceSnapshot::FALLBACK;

        let memory = self.probe.memory().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read memory stats, using fallback");
            fallback.memory
        });
        let disk = self.probe.disk().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read disk stats, using fallback");
            fallback.disk
        });
        let cpu = self.probe.cpu().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read CPU load, using fallback");
            fallback.cpu
        });

        tracing::debug!(
            memory_available_mb = memory.available_mb,
            disk_available_gb = disk.available_gb,
            cpu_load = cpu.load,
            "Host resources checked"
        );

        ResourceSnapshot { memory, disk, cpu }
    }

    /// Compare the host against the admission thresholds, listing every
    /// threshold that is not met.
    pub fn validate_for_new_instance(&self) -> AdmissionReport {
        let resources = self.check_resources();
        let t = &self.thresholds;
        let mut issues = Vec::new();

        if resources.memory.available_mb < t.min_memory_mb {
            issues.push(format!(
                "insufficient memory: {}MB available, {}MB required (free at least {}MB)",
                resources.memory.available_mb,
                t.min_memory_mb,
                t.min_memory_mb - resources.memory.available_mb
            ));
        }

        if resources.disk.available_gb < t.min_disk_gb {
            issues.push(format!(
                "insufficient disk space: {}GB available, {}GB required (free at least {}GB)",
                resources.disk.available_gb,
                t.min_disk_gb,
                t.min_disk_gb - resources.disk.available_gb
            ));
        }

        if resources.cpu.load > t.max_cpu_percent {
            issues.push(format!(
                "CPU overloaded: {}% load, maximum {}%",
                resources.cpu.load, t.max_cpu_percent
            ));
        }

        AdmissionReport {
            can_create: issues.is_empty(),
            issues,
            resources,
        }
    }
}
