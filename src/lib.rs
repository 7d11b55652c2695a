//! AgentVisor - pluggable isolation for coding-agent workspaces
//!
//! Each agent's workspace runs behind one uniform interface in one of three
//! backends: directly on the host, in a hardened container, or inside a
//! cloud-hypervisor VM with virtio-fs shares, vsock command execution and a
//! per-VM egress proxy.
//!
//! # Modules
//!
//! - `adapter` - the `IsolationAdapter` contract and backend registry
//! - `container` - docker/podman backend
//! - `vm` - cloud-hypervisor backend
//! - `proxy` - domain-allowlisting HTTP/CONNECT egress proxy
//! - `cgroups` - cgroups v2 limits for VM processes
//! - `lifecycle` - per-agent environment ownership, persistence and events
//! - `settings` - host configuration
//! - `metrics` - Prometheus metrics
//! - `tracing` - tracing subscriber and optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use agentvisor::{IsolationManager, Settings};
//!
//! let settings = Settings::load()?;
//! let manager = IsolationManager::from_settings(&settings);
//! manager.restore().await?;
//!
//! let env = manager
//!     .create("repo:dev", &worktree, "agent-1", &repo, None)
//!     .await?;
//! let out = manager.exec("agent-1", "cargo test").await?;
//! ```

pub mod adapter;
pub mod cgroups;
pub mod container;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use adapter::{AdapterRegistry, EnvironmentHandle, IsolationAdapter};
pub use error::{IsolationError, Result};
pub use lifecycle::{EnvironmentInfo, EnvironmentState, IsolationManager, LifecycleEvent};
pub use settings::Settings;
