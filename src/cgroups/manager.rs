//! cgroup v2 resource accounting for VM supervisors
//!
//! Each VM gets its own cgroup under `/sys/fs/cgroup/agentvisor/<agent>/`.
//!
//! ```text
//! /sys/fs/cgroup/                     ← cgroup v2 root
//! └── agentvisor/                     ← our namespace (must be delegated)
//!     ├── agent-1/
//!     │   ├── cpu.max                 ← "200000 100000" = 2 cores
//!     │   ├── memory.max              ← bytes
//!     │   ├── memory.current          ← read by stats
//!     │   ├── cpu.stat                ← read by stats
//!     │   └── cgroup.procs            ← supervisor pid
//!     └── agent-2/
//! ```
//!
//! The namespace is only usable when the orchestrator's user may write to it.
//! Without delegation [`CgroupManager::new`] fails and the VM backend runs
//! without accounting.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Base path for cgroup v2 filesystem
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Our namespace within the cgroup hierarchy
const CGROUP_NAMESPACE: &str = "agentvisor";

/// Scheduler period written to `cpu.max`, in microseconds
const CPU_PERIOD_USEC: u64 = 100_000;

/// Headroom on top of guest RAM for the supervisor's own allocations
pub const VMM_OVERHEAD_MB: u64 = 256;

/// Resource limits for one VM
///
/// `cpu.max` uses "{quota} {period}": "200000 100000" is two full cores.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Number of CPU cores (fractional allowed)
    pub cpu_cores: f64,
    /// Memory limit in bytes
    pub memory_bytes: u64,
}

impl ResourceLimits {
    /// Limits for a guest with `memory_mb` of RAM and `vcpus` cores
    pub fn for_vm(memory_mb: u32, vcpus: u32) -> Self {
        Self {
            cpu_cores: vcpus as f64,
            memory_bytes: (memory_mb as u64 + VMM_OVERHEAD_MB) * 1024 * 1024,
        }
    }

    fn cpu_max(&self) -> String {
        let quota = (self.cpu_cores * CPU_PERIOD_USEC as f64) as u64;
        format!("{} {}", quota, CPU_PERIOD_USEC)
    }
}

/// Manages per-VM cgroups under one namespace directory
#[derive(Debug, Clone)]
pub struct CgroupManager {
    base_path: PathBuf,
}

impl CgroupManager {
    /// Open `/sys/fs/cgroup/agentvisor`, creating it and enabling the cpu
    /// and memory controllers for its children
    ///
    /// Fails with permission errors when the namespace is not delegated.
    pub fn new() -> io::Result<Self> {
        let base_path = PathBuf::from(CGROUP_ROOT).join(CGROUP_NAMESPACE);
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        // Children can only use controllers enabled in the parent's subtree_control
        fs::write(base_path.join("cgroup.subtree_control"), "+cpu +memory")?;
        Ok(Self { base_path })
    }

    /// Manager rooted at an arbitrary directory, without touching controllers
    pub fn with_base(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn group_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Create the cgroup for `name` and write its limits
    pub fn create(&self, name: &str, limits: &ResourceLimits) -> io::Result<()> {
        let path = self.group_path(name);
        fs::create_dir_all(&path)?;
        fs::write(path.join("cpu.max"), limits.cpu_max())?;
        fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
        tracing::debug!(cgroup = %path.display(), cpu_max = %limits.cpu_max(), memory_max = limits.memory_bytes, "cgroup created");
        Ok(())
    }

    /// Move `pid` (and its threads) into the cgroup
    pub fn add_process(&self, name: &str, pid: u32) -> io::Result<()> {
        fs::write(self.group_path(name).join("cgroup.procs"), pid.to_string())
    }

    /// Remove the cgroup; the kernel refuses while processes remain inside
    pub fn destroy(&self, name: &str) -> io::Result<()> {
        let path = self.group_path(name);
        if path.exists() {
            // rmdir, not rm -rf: the control files are kernel-owned
            fs::remove_dir(&path)?;
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.group_path(name).exists()
    }

    /// Current memory usage in bytes (`memory.current`)
    pub fn get_memory_usage(&self, name: &str) -> io::Result<u64> {
        let content = fs::read_to_string(self.group_path(name).join("memory.current"))?;
        content
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Parsed `cpu.stat`
    pub fn get_cpu_stats(&self, name: &str) -> io::Result<CpuStats> {
        let content = fs::read_to_string(self.group_path(name).join("cpu.stat"))?;
        Ok(CpuStats::parse(&content))
    }
}

/// CPU statistics from cpu.stat
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CpuStats {
    /// Total CPU time consumed (microseconds)
    pub usage_usec: u64,
    pub user_usec: u64,
    pub system_usec: u64,
    pub nr_throttled: u64,
    pub throttled_usec: u64,
}

impl CpuStats {
    fn parse(content: &str) -> Self {
        let mut stats = CpuStats::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value: u64 = value.parse().unwrap_or(0);
            match key {
                "usage_usec" => stats.usage_usec = value,
                "user_usec" => stats.user_usec = value,
                "system_usec" => stats.system_usec = value,
                "nr_throttled" => stats.nr_throttled = value,
                "throttled_usec" => stats.throttled_usec = value,
                _ => {}
            }
        }
        stats
    }
}

/// CPU percentage from two `usage_usec` samples taken `elapsed_usec` apart.
///
/// 100% is one fully busy core, so a 4-vcpu guest can report up to 400%.
pub fn cpu_percent(before: &CpuStats, after: &CpuStats, elapsed_usec: u64) -> f64 {
    if elapsed_usec == 0 {
        return 0.0;
    }
    let used = after.usage_usec.saturating_sub(before.usage_usec);
    used as f64 / elapsed_usec as f64 * 100.0
}
