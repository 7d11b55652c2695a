//! cgroups v2 resource accounting
//!
//! Optional: the VM backend places each supervisor in its own cgroup when
//! the `agentvisor` namespace is delegated to the orchestrator's user, and
//! reads usage back from it for stats.
//!
//! ```ignore
//! use agentvisor::cgroups::{CgroupManager, ResourceLimits};
//!
//! let cgroups = CgroupManager::new()?;
//! cgroups.create("agent-1", &ResourceLimits::for_vm(4096, 2))?;
//! cgroups.add_process("agent-1", supervisor_pid)?;
//! let memory = cgroups.get_memory_usage("agent-1")?;
//! cgroups.destroy("agent-1")?;
//! ```

pub mod manager;

pub use manager::{cpu_percent, CgroupManager, CpuStats, ResourceLimits};
