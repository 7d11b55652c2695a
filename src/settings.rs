//! Process-wide settings for the isolation layer
//!
//! Settings are resolved once at startup: defaults, then an optional JSON file
//! named by `AGENTVISOR_CONFIG`, then individual `AGENTVISOR_*` overrides.
//! Unknown JSON fields are ignored and missing ones keep their defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{IsolationError, Result};

/// Environment variable naming an optional JSON settings file
pub const CONFIG_ENV: &str = "AGENTVISOR_CONFIG";

/// Settings shared by the adapters and the lifecycle manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for persisted state (~/.agentvisor)
    pub state_dir: PathBuf,
    /// Root for per-VM runtime directories (sockets, pid files)
    pub runtime_dir: PathBuf,
    /// Host directory mounted into every VM as the credentials share
    pub credentials_dir: Option<PathBuf>,
    /// Container engine CLI ("docker" or "podman")
    pub container_engine: String,
    /// VM supervisor binary (cloud-hypervisor)
    pub supervisor_binary: PathBuf,
    /// virtio-fs daemon binary
    pub virtiofsd_binary: PathBuf,
    /// Terminal multiplexer binary hosting the supervisor console
    pub multiplexer_binary: PathBuf,
    /// Host bridge TAP devices are attached to
    pub bridge_name: String,
    /// Naming prefix of TAP devices owned by this subsystem
    pub tap_prefix: String,
    /// First three octets of the bridge subnet (gateway is .1)
    pub bridge_subnet: String,
    /// DNS server handed to guests on the bridge network
    pub dns_server: String,
    /// Pre-authorized privileged `ip` invocation, e.g. ["sudo", "-n", "ip"]
    pub net_helper: Vec<String>,
    /// sysfs directory listing host network interfaces
    pub sysfs_net_dir: PathBuf,
    /// Guest vsock port the egress proxy is reachable on
    pub proxy_vsock_port: u32,
    /// Guest vsock port the control agent listens on
    pub control_vsock_port: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: home.join(".agentvisor"),
            runtime_dir: default_runtime_dir(),
            credentials_dir: None,
            container_engine: "docker".to_string(),
            supervisor_binary: PathBuf::from("cloud-hypervisor"),
            virtiofsd_binary: PathBuf::from("virtiofsd"),
            multiplexer_binary: PathBuf::from("tmux"),
            bridge_name: "avbr0".to_string(),
            tap_prefix: "tap".to_string(),
            bridge_subnet: "10.200.0".to_string(),
            dns_server: "1.1.1.1".to_string(),
            net_helper: vec!["sudo".to_string(), "-n".to_string(), "ip".to_string()],
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
            proxy_vsock_port: 3128,
            control_vsock_port: 5000,
        }
    }
}

impl Settings {
    /// Resolve settings from the config file and environment overrides
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IsolationError::definition(path, e))?;
        serde_json::from_str(&text).map_err(|e| IsolationError::definition(path, e))
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("AGENTVISOR_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTVISOR_RUNTIME_DIR") {
            self.runtime_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTVISOR_CREDENTIALS_DIR") {
            self.credentials_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AGENTVISOR_CONTAINER_ENGINE") {
            self.container_engine = v;
        }
        if let Some(v) = lookup("AGENTVISOR_SUPERVISOR") {
            self.supervisor_binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTVISOR_VIRTIOFSD") {
            self.virtiofsd_binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTVISOR_BRIDGE") {
            self.bridge_name = v;
        }
    }

    /// Directory holding persisted lifecycle state
    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    /// Credentials share mounted into every VM
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("credentials"))
    }

    /// Bridge gateway address (x.y.z.1)
    pub fn gateway_ip(&self) -> String {
        format!("{}.1", self.bridge_subnet)
    }
}

fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("agentvisor"),
        None => PathBuf::from(format!("/tmp/agentvisor-{}", nix::unistd::getuid())),
    }
}
