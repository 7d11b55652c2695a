//! Container definition files
//!
//! JSON, camelCase keys, unknown keys ignored. Missing fields fall back to the
//! hardened defaults below; the only way to loosen them is an explicit value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{IsolationError, Result};

pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";
pub const DEFAULT_MEMORY: &str = "4g";
pub const DEFAULT_CPUS: f64 = 2.0;
pub const DEFAULT_PIDS: u32 = 100;
pub const DEFAULT_TMP_SIZE: &str = "100m";
pub const DEFAULT_HOME_SIZE: &str = "500m";
pub const DEFAULT_NETWORK: &str = "none";

/// An extra bind mount requested by the definition
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMount {
    /// Host path; relative paths resolve against the workspace, `~` against home
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerDefinition {
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub network: String,
    pub mounts: Vec<ContainerMount>,
    pub environment: BTreeMap<String, String>,
    pub read_only: bool,
    pub entrypoint: Vec<String>,
    pub pids_limit: u32,
    pub tmp_size: String,
    pub home_size: String,
}

impl Default for ContainerDefinition {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            memory_limit: DEFAULT_MEMORY.to_string(),
            cpu_limit: DEFAULT_CPUS,
            network: DEFAULT_NETWORK.to_string(),
            mounts: Vec::new(),
            environment: BTreeMap::new(),
            read_only: true,
            entrypoint: vec!["sleep".to_string(), "infinity".to_string()],
            pids_limit: DEFAULT_PIDS,
            tmp_size: DEFAULT_TMP_SIZE.to_string(),
            home_size: DEFAULT_HOME_SIZE.to_string(),
        }
    }
}

impl ContainerDefinition {
    /// Load a definition; `None` yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text =
            std::fs::read_to_string(path).map_err(|e| IsolationError::definition(path, e))?;
        let mut def: Self =
            serde_json::from_str(&text).map_err(|e| IsolationError::definition(path, e))?;
        if def.image.trim().is_empty() {
            return Err(IsolationError::definition(path, "image must not be empty"));
        }
        if def.entrypoint.is_empty() {
            def.entrypoint = Self::default().entrypoint;
        }
        Ok(def)
    }

    /// Human-readable limits for display
    pub fn limits(&self) -> Vec<String> {
        let mut limits = vec![
            format!("memory {}", self.memory_limit),
            format!("cpus {}", self.cpu_limit),
            format!("pids {}", self.pids_limit),
            format!("network {}", self.network),
        ];
        if self.read_only {
            limits.push("read-only rootfs".to_string());
        }
        limits
    }
}

/// Resolve a mount source against the workspace or the host home directory
pub fn resolve_source(source: &str, workspace: &Path, home: Option<&Path>) -> PathBuf {
    if source == "~" {
        if let Some(home) = home {
            return home.to_path_buf();
        }
    }
    if let Some(rest) = source.strip_prefix("~/") {
        if let Some(home) = home {
            return home.join(rest);
        }
    }
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}
