//! Supervisor boot arguments
//!
//! Everything here is a pure function of the definition and the allocation so
//! the exact command line can be asserted in tests.

use std::path::PathBuf;

use super::definition::{VirtioFsMount, VmDefinition};

/// Static addressing handed to the guest when a TAP device was allocated
#[derive(Debug, Clone, PartialEq)]
pub struct GuestNetwork {
    pub tap_name: String,
    pub mac: String,
    pub guest_ip: String,
    pub gateway_ip: String,
    pub dns: String,
}

impl GuestNetwork {
    /// Kernel `ip=` parameter: `ip=<client>::<gw>:<netmask>::<dev>:<autoconf>:<dns>`
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.0::eth0:off:{}",
            self.guest_ip, self.gateway_ip, self.dns
        )
    }
}

/// Fully resolved launch description for one VM
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub definition: &'a VmDefinition,
    pub mounts: &'a [VirtioFsMount],
    /// `(tag, virtiofsd socket)` for every entry in `mounts`
    pub fs_sockets: Vec<(String, PathBuf)>,
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub cid: u32,
    pub session_hint: Option<&'a str>,
    pub network: Option<GuestNetwork>,
}

impl LaunchSpec<'_> {
    /// Guest kernel command line
    pub fn kernel_cmdline(&self) -> String {
        let user = if self.definition.run_as_root {
            "root"
        } else {
            "agent"
        };
        let mount_map = self
            .mounts
            .iter()
            .map(|m| format!("{}:{}", m.tag, m.guest_path))
            .collect::<Vec<_>>()
            .join(",");

        let mut parts = vec![
            "console=ttyS0".to_string(),
            "root=/dev/vda".to_string(),
            "rw".to_string(),
            format!("agentvisor.user={}", user),
            format!("agentvisor.mounts={}", mount_map),
        ];
        if let Some(hint) = self.session_hint.filter(|h| !h.is_empty()) {
            parts.push(format!("agentvisor.session={}", sanitize_hint(hint)));
        }
        if let Some(net) = &self.network {
            parts.push(net.kernel_ip_arg());
        }
        parts.join(" ")
    }

    /// Arguments following the supervisor binary
    pub fn supervisor_args(&self) -> Vec<String> {
        let def = self.definition;
        let mut args = vec![
            "--api-socket".to_string(),
            format!("path={}", self.api_socket.display()),
            "--kernel".to_string(),
            def.kernel_path.display().to_string(),
            "--disk".to_string(),
            format!("path={}", def.rootfs_path.display()),
            "--cmdline".to_string(),
            self.kernel_cmdline(),
            "--memory".to_string(),
            format!("size={}M,shared=on", def.memory_mb),
            "--cpus".to_string(),
            format!("boot={}", def.vcpu_count),
        ];

        if !self.fs_sockets.is_empty() {
            args.push("--fs".to_string());
            for (tag, socket) in &self.fs_sockets {
                args.push(format!(
                    "tag={},socket={},num_queues=1,queue_size=512",
                    tag,
                    socket.display()
                ));
            }
        }

        args.push("--vsock".to_string());
        args.push(format!(
            "cid={},socket={}",
            self.cid,
            self.vsock_socket.display()
        ));
        args.extend([
            "--serial".to_string(),
            "tty".to_string(),
            "--console".to_string(),
            "off".to_string(),
        ]);

        if let Some(net) = &self.network {
            args.push("--net".to_string());
            args.push(format!("tap={},mac={}", net.tap_name, net.mac));
        }
        args
    }
}

/// Session hints land on the kernel command line, which is whitespace separated
fn sanitize_hint(hint: &str) -> String {
    hint.chars()
        .map(|c| if c.is_whitespace() || c == '"' { '_' } else { c })
        .collect()
}
