//! Host fact collection
//!
//! Collects the facts reported at registration: OS, arch, kernel,
//! hostname, primary IPv4, CPU count, memory, and root disk size. Inside a
//! container the cgroup (v2, then v1) CPU and memory limits take
//! precedence over host values, so a constrained pod reports its quota
//! rather than the machine underneath it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::process::Command;
use sysinfo::{Disks, System};

/// Collected host facts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<i64>,
}

impl HostMetadata {
    /// Facts as a registration attrs object
    pub fn to_attrs(&self) -> Value {
        json!(self)
    }
}

/// Host fact collector
pub struct Collector;

impl Collector {
    pub fn new() -> Self {
        Self
    }

    /// Collect all facts. Individual probes fail soft; a fact that cannot
    /// be determined is simply absent.
    pub fn collect(&self) -> HostMetadata {
        let mut sys = System::new();
        sys.refresh_memory();

        HostMetadata {
            os_name: System::name().map(|n| n.to_lowercase()),
            os_version: read_os_release_pretty_name().or_else(System::os_version),
            arch: Some(std::env::consts::ARCH.to_string()),
            kernel_version: System::kernel_version(),
            hostname: System::host_name(),
            ip_address: primary_ipv4(),
            cpu_cores: Some(cgroup_cpu_limit().unwrap_or_else(|| num_cpus::get() as i64)),
            memory_mb: cgroup_memory_limit_mb()
                .or_else(|| Some((sys.total_memory() / (1024 * 1024)) as i64))
                .filter(|mb| *mb > 0),
            disk_gb: root_disk_gb(),
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

fn read_os_release_pretty_name() -> Option<String> {
    let data = std::fs::read_to_string("/etc/os-release").ok()?;
    data.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}

/// Primary IPv4: the source address of the default route, falling back to
/// the first address `hostname -I` reports.
fn primary_ipv4() -> Option<String> {
    if let Some(output) = run_command("ip", &["route", "get", "1"]) {
        let fields: Vec<&str> = output.split_whitespace().collect();
        if let Some(pos) = fields.iter().position(|f| *f == "src") {
            if let Some(addr) = fields.get(pos + 1) {
                return Some(addr.to_string());
            }
        }
    }

    run_command("hostname", &["-I"])
        .and_then(|out| out.split_whitespace().next().map(str::to_string))
}

/// CPU limit from cgroup v2 `cpu.max`, then v1 cfs quota/period
fn cgroup_cpu_limit() -> Option<i64> {
    if let Ok(data) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let mut parts = data.split_whitespace();
        let quota = parts.next()?;
        let period: f64 = parts.next()?.parse().ok()?;
        if quota != "max" {
            let quota: f64 = quota.parse().ok()?;
            return Some((quota / period).ceil() as i64);
        }
        return None;
    }

    let quota: f64 = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let period: f64 = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if quota <= 0.0 || period <= 0.0 {
        return None;
    }
    Some((quota / period).ceil() as i64)
}

/// Memory limit from cgroup v2 `memory.max`, then v1 `memory.limit_in_bytes`
fn cgroup_memory_limit_mb() -> Option<i64> {
    let raw = std::fs::read_to_string("/sys/fs/cgroup/memory.max")
        .or_else(|_| std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes"))
        .ok()?;
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    let bytes: i64 = raw.parse().ok()?;
    // Unset v1 limits read back as an enormous sentinel.
    if bytes <= 0 || bytes >= (1_i64 << 60) {
        return None;
    }
    Some(bytes / (1024 * 1024))
}

fn root_disk_gb() -> Option<i64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .map(|d| (d.total_space() / (1024 * 1024 * 1024)) as i64)
}

fn run_command(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}
