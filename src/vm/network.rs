//! Host-side TAP networking
//!
//! The orchestrator never runs as root. The supervisor creates the TAP device
//! itself (it carries `cap_net_admin`), and the two privileged steps left,
//! enslaving the device to the bridge and bringing it up, go through a
//! pre-authorized helper such as `sudo -n ip`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{IsolationError, Result};

/// Upper bound for each privileged helper call
pub const NET_HELPER_TIMEOUT: Duration = Duration::from_secs(10);
const GETCAP_TIMEOUT: Duration = Duration::from_secs(5);

/// TAP networking needs the bridge and a supervisor able to create devices
pub async fn tap_networking_available(
    sysfs_net_dir: &Path,
    bridge: &str,
    supervisor_binary: &Path,
) -> bool {
    if !sysfs_net_dir.join(bridge).exists() {
        tracing::debug!(bridge, "bridge interface missing, VMs boot without TAP networking");
        return false;
    }
    let resolved = which::which(supervisor_binary).unwrap_or_else(|_| supervisor_binary.to_path_buf());
    let mut cmd = Command::new("getcap");
    cmd.arg(&resolved)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(GETCAP_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => {
            let has_cap = String::from_utf8_lossy(&out.stdout).contains("cap_net_admin");
            if !has_cap {
                tracing::debug!(supervisor = %resolved.display(), "supervisor lacks cap_net_admin");
            }
            has_cap
        }
        _ => false,
    }
}

/// Runs `ip` subcommands through the configured privileged helper
#[derive(Debug, Clone)]
pub struct NetHelper {
    argv: Vec<String>,
}

impl NetHelper {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        let (program, prefix) = self
            .argv
            .split_first()
            .ok_or_else(|| IsolationError::spawn("net helper", "no helper command configured"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rendered = format!("{} {}", self.argv.join(" "), args.join(" "));
        match tokio::time::timeout(NET_HELPER_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(IsolationError::spawn(
                rendered,
                String::from_utf8_lossy(&out.stderr).trim(),
            )),
            Ok(Err(e)) => Err(IsolationError::spawn(rendered, e)),
            Err(_) => Err(IsolationError::spawn(
                rendered,
                format!("timed out after {:?}", NET_HELPER_TIMEOUT),
            )),
        }
    }

    /// Attach `tap` to `bridge` and bring it up
    pub async fn attach(&self, tap: &str, bridge: &str) -> Result<()> {
        self.ip(&["link", "set", tap, "master", bridge]).await?;
        self.ip(&["link", "set", tap, "up"]).await?;
        tracing::info!(tap, bridge, "tap attached to bridge");
        Ok(())
    }
}
