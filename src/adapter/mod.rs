//! Isolation adapter contract
//!
//! Every backend (no isolation, container, VM) implements [`IsolationAdapter`].
//! The lifecycle manager only ever talks to this trait, so adding a backend
//! means registering one more adapter in the [`AdapterRegistry`].
//!
//! # Capabilities
//!
//! The required core is `is_available`, `display_info`, `create`, `exec` and
//! `destroy`. Everything else is optional and advertised through
//! [`IsolationAdapter::capabilities`]:
//!
//! ```text
//! ┌──────────────────┬───────────────┬───────────┬──────────┐
//! │ capability       │ unisolated    │ container │ vm       │
//! ├──────────────────┼───────────────┼───────────┼──────────┤
//! │ Stats            │               │     ✓     │    ✓     │
//! │ ShellAttach      │               │     ✓     │    ✓     │
//! │ WorkspaceCleanup │               │     ✓     │    ✓     │
//! │ OrphanListing    │               │     ✓     │          │
//! │ LiveProbe        │       ✓       │     ✓     │    ✓     │
//! └──────────────────┴───────────────┴───────────┴──────────┘
//! ```
//!
//! Optional methods have default bodies that report "unsupported" without
//! touching the host, so callers check [`IsolationAdapter::supports`] first.

pub mod registry;
pub mod unisolated;

pub use registry::AdapterRegistry;
pub use unisolated::UnisolatedAdapter;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{IsolationError, Result};

/// Optional adapter capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Live memory / CPU usage
    Stats,
    /// Interactive shell command for a human
    ShellAttach,
    /// Sweep environments tied to a workspace path
    WorkspaceCleanup,
    /// List every environment this system created on the host
    OrphanListing,
    /// Query whether a handle is still running
    LiveProbe,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Stats => "stats",
            Capability::ShellAttach => "shell attach",
            Capability::WorkspaceCleanup => "workspace cleanup",
            Capability::OrphanListing => "orphan listing",
            Capability::LiveProbe => "live probe",
        }
    }
}

/// Opaque identifier of a running environment, issued by `create`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentHandle(pub String);

impl EnvironmentHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful `create`
#[derive(Debug, Clone)]
pub struct CreatedEnvironment {
    pub handle: EnvironmentHandle,
    /// Guest-side port of the egress proxy, when the backend runs one
    pub proxy_port: Option<u16>,
}

impl CreatedEnvironment {
    pub fn new(handle: EnvironmentHandle) -> Self {
        Self {
            handle,
            proxy_port: None,
        }
    }
}

/// Read-only description of a configuration, for UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayInfo {
    pub name: String,
    pub description: String,
    pub limits: Vec<String>,
}

/// Normalized resource usage of an environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvironmentStats {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Command a caller can run to get an interactive shell in the environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Live state of a handle as reported by its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Running,
    Stopped,
    /// The backend has no trace of the handle
    Gone,
    /// The backend cannot tell
    Unknown,
}

/// An environment found through the backend's native listing
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedEnvironment {
    pub handle: EnvironmentHandle,
    pub agent_id: Option<String>,
    pub workspace_path: Option<PathBuf>,
}

/// Capability interface implemented by every isolation backend
#[async_trait]
pub trait IsolationAdapter: Send + Sync {
    /// Backend type string this adapter is registered under
    fn backend_type(&self) -> &'static str;

    /// Optional capabilities this backend implements
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Cheap host capability probe; never fails
    async fn is_available(&self) -> bool;

    /// Describe a configuration without side effects
    async fn display_info(&self, definition_file: Option<&Path>) -> Result<DisplayInfo>;

    /// Allocate an environment for `agent_id` with `workspace_path` mounted
    ///
    /// All-or-nothing: on error nothing started by this call is left running.
    async fn create(
        &self,
        definition_file: Option<&Path>,
        workspace_path: &Path,
        agent_id: &str,
        session_hint: Option<&str>,
    ) -> Result<CreatedEnvironment>;

    /// Run a shell command inside the environment and return its output
    async fn exec(&self, handle: &EnvironmentHandle, command: &str) -> Result<String>;

    /// Release everything behind `handle`; unknown handles are a no-op
    async fn destroy(&self, handle: &EnvironmentHandle);

    async fn stats(&self, _handle: &EnvironmentHandle) -> Result<Option<EnvironmentStats>> {
        Ok(None)
    }

    async fn shell_attach_command(
        &self,
        _handle: &EnvironmentHandle,
        _workspace_path: &Path,
    ) -> Result<Option<ShellSpec>> {
        Ok(None)
    }

    async fn cleanup_by_workspace(&self, _workspace_path: &Path) -> Result<()> {
        Err(self.unsupported(Capability::WorkspaceCleanup))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedEnvironment>> {
        Err(self.unsupported(Capability::OrphanListing))
    }

    /// Report the live state of a handle recorded in an earlier process.
    ///
    /// Backends with in-memory bookkeeping re-adopt the environment when it
    /// is still alive, so later `exec`/`destroy` calls work after a restart.
    async fn probe(
        &self,
        _handle: &EnvironmentHandle,
        _agent_id: &str,
        _workspace_path: &Path,
    ) -> HandleState {
        HandleState::Unknown
    }

    fn unsupported(&self, capability: Capability) -> IsolationError {
        IsolationError::Unsupported {
            backend: self.backend_type().to_string(),
            capability: capability.as_str(),
        }
    }
}

/// Sanitize a string for use in container names, session names and paths.
///
/// Lowercases, maps anything outside `[a-z0-9_-]` to `-`, collapses runs of
/// `-`, and trims them from both ends.
pub fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Per-agent key for runtime directories, session names, cgroups and
/// container names.
///
/// Distinct agent ids always give distinct keys: the sanitized id is
/// suffixed with 8 hex digits of a name-based UUID of the raw id, which is
/// stable across processes.
pub fn agent_key(agent_id: &str) -> String {
    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, agent_id.as_bytes())
        .simple()
        .to_string();
    let suffix = &digest[..8];
    match sanitize_id(agent_id) {
        name if name.is_empty() => suffix.to_string(),
        name => format!("{}-{}", name, suffix),
    }
}
