//! VM backend
//!
//! Boots one cloud-hypervisor microVM per agent. Creation is a straight line
//! with a single failure exit:
//!
//! ```text
//! preflight ─► allocate ids ─► virtiofsd × N ─► egress proxy ─► supervisor (tmux)
//!     ─► api.sock ─► cgroup ─► TAP attach ─► vm.json ─► running
//!                    │ any error
//!                    ▼
//!                teardown (idempotent, never fails)
//! ```
//!
//! Teardown runs in reverse dependency order: proxy, graceful shutdown,
//! multiplexer session, virtiofsd daemons, supervisor, cgroup, TAP index,
//! runtime directory. Each step logs its own failure and the rest still run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::allocator::{guest_ip, guest_mac, tap_name, Allocation, SharedAllocator};
use super::api::SupervisorClient;
use super::control::ControlClient;
use super::definition::VmDefinition;
use super::handle::{load_records, RunningVm, VmPaths, VmRecord};
use super::launch::{GuestNetwork, LaunchSpec};
use super::network::{tap_networking_available, NetHelper};
use super::process::{
    cmdline_mentions, kill_processes_referencing, read_pid_file, shell_quote, wait_for_path,
    MultiplexerSession, SupervisedProcess,
};
use crate::adapter::{
    agent_key, Capability, CreatedEnvironment, DisplayInfo, EnvironmentHandle,
    EnvironmentStats, HandleState, IsolationAdapter, ShellSpec,
};
use crate::cgroups::{cpu_percent, CgroupManager, ResourceLimits};
use crate::error::{IsolationError, Result};
use crate::metrics::VM_BOOT_DURATION;
use crate::proxy::{DomainPolicy, ProxyEndpoint, ProxySupervisor};
use crate::settings::Settings;

/// Backend type string of the VM adapter
pub const VM: &str = "vm";

const VIRTIOFS_POLL: Duration = Duration::from_millis(100);
const VIRTIOFS_TIMEOUT: Duration = Duration::from_secs(5);
const API_SOCKET_POLL: Duration = Duration::from_millis(100);
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const TAP_POLL: Duration = Duration::from_millis(100);
const TAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Time the guest gets to power off after `vm.shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// SIGTERM → SIGKILL grace for every host process
const KILL_GRACE: Duration = Duration::from_secs(2);
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Console lines attached to a supervisor readiness timeout
const CONSOLE_TAIL_LINES: u32 = 50;
/// Gap between the two `cpu.stat` samples behind a stats call
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

const SESSION_PREFIX: &str = "agentvisor-";

const CAPABILITIES: &[Capability] = &[
    Capability::Stats,
    Capability::ShellAttach,
    Capability::WorkspaceCleanup,
    Capability::LiveProbe,
];

/// cloud-hypervisor backed isolation
pub struct VmAdapter {
    settings: Settings,
    allocator: SharedAllocator,
    vms: Mutex<HashMap<EnvironmentHandle, RunningVm>>,
    cgroups: Option<CgroupManager>,
    proxies: ProxySupervisor,
    net_helper: NetHelper,
}

impl VmAdapter {
    /// Create the adapter without resource accounting
    pub fn new(settings: Settings, allocator: SharedAllocator) -> Self {
        let net_helper = NetHelper::new(settings.net_helper.clone());
        Self {
            settings,
            allocator,
            vms: Mutex::new(HashMap::new()),
            cgroups: None,
            proxies: ProxySupervisor::new(),
            net_helper,
        }
    }

    /// Enable cgroup accounting when the host namespace is writable
    pub fn with_host_cgroups(self) -> Self {
        let cgroups = match CgroupManager::new() {
            Ok(cgroups) => {
                tracing::debug!(base = %cgroups.base_path().display(), "cgroup accounting enabled");
                Some(cgroups)
            }
            Err(e) => {
                tracing::debug!(error = %e, "cgroup namespace not writable, VMs run without accounting");
                None
            }
        };
        self.with_cgroups(cgroups)
    }

    /// Replace the cgroup manager (`None` disables accounting)
    pub fn with_cgroups(mut self, cgroups: Option<CgroupManager>) -> Self {
        self.cgroups = cgroups;
        self
    }

    fn paths_for(&self, agent_id: &str) -> VmPaths {
        VmPaths::new(self.settings.runtime_dir.join(agent_key(agent_id)))
    }

    fn session_for(&self, agent_id: &str) -> MultiplexerSession {
        MultiplexerSession::new(
            &self.settings.multiplexer_binary,
            format!("{}{}", SESSION_PREFIX, agent_key(agent_id)),
        )
    }

    /// Clear whatever a crashed orchestrator left for this agent
    async fn preflight(&self, agent_id: &str, paths: &VmPaths, session: &MultiplexerSession) -> Result<()> {
        let stale: Vec<RunningVm> = {
            let mut vms = self.vms.lock().await;
            let handles: Vec<EnvironmentHandle> = vms
                .values()
                .filter(|vm| vm.record.agent_id == agent_id)
                .map(|vm| vm.handle().clone())
                .collect();
            handles.iter().filter_map(|h| vms.remove(h)).collect()
        };
        for vm in stale {
            tracing::warn!(agent_id, handle = %vm.handle(), "tearing down previous VM for agent");
            self.teardown(vm).await;
        }

        session.kill().await;
        let multiplexer = session
            .binary()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let killed =
            kill_processes_referencing(&paths.runtime_dir, &[multiplexer.as_str()], KILL_GRACE).await;
        if killed > 0 {
            tracing::info!(agent_id, killed, "cleared stale VM processes");
        }
        match std::fs::remove_dir_all(&paths.runtime_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&paths.runtime_dir)?;
        Ok(())
    }

    async fn allocate(&self) -> Result<Allocation> {
        let want_tap = tap_networking_available(
            &self.settings.sysfs_net_dir,
            &self.settings.bridge_name,
            &self.settings.supervisor_binary,
        )
        .await;

        let mut allocator = self.allocator.lock().await;
        // CIDs recorded by VMs of an earlier process may still be live
        for (_, record) in load_records(&self.settings.runtime_dir) {
            allocator.observe_cid(record.cid);
        }
        allocator.allocate(want_tap)
    }

    /// Steps after allocation; partial state accumulates in `vm` so the
    /// caller can tear it down on error
    async fn boot(&self, vm: &mut RunningVm, session_hint: Option<&str>) -> Result<()> {
        let settings = &self.settings;
        let credentials = settings.credentials_path();
        std::fs::create_dir_all(&credentials)?;
        let mounts = vm
            .record
            .definition
            .all_mounts(&vm.record.workspace_path, &credentials);

        let mut fs_sockets = Vec::with_capacity(mounts.len());
        for mount in &mounts {
            if !mount.host_path.exists() {
                return Err(IsolationError::definition(
                    &mount.host_path,
                    format!("source of mount '{}' does not exist", mount.tag),
                ));
            }
            let socket = vm.paths.fs_socket(&mount.tag);
            let mut cmd = Command::new(&settings.virtiofsd_binary);
            cmd.arg(format!("--socket-path={}", socket.display()))
                .arg(format!("--shared-dir={}", mount.host_path.display()))
                .arg("--cache=auto")
                .arg("--sandbox=none")
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if mount.read_only {
                cmd.arg("--readonly");
            }
            let daemon = SupervisedProcess::spawn(format!("virtiofsd[{}]", mount.tag), &mut cmd)?;
            tracing::debug!(tag = %mount.tag, pid = daemon.pid(), "virtiofsd started");
            vm.virtiofsd.push(daemon);

            if !wait_for_path(&socket, VIRTIOFS_POLL, VIRTIOFS_TIMEOUT).await {
                return Err(IsolationError::ReadinessTimeout {
                    what: format!("virtiofsd socket for '{}'", mount.tag),
                    waited: VIRTIOFS_TIMEOUT,
                    diagnostics: None,
                });
            }
            fs_sockets.push((mount.tag.clone(), socket));
        }

        let definition = &vm.record.definition;
        let policy = DomainPolicy::new(&definition.allowed_domains, definition.allow_all_traffic);
        self.proxies
            .start(
                vm.handle().as_str(),
                ProxyEndpoint::Unix(vm.paths.vsock_listener(settings.proxy_vsock_port)),
                policy,
            )
            .await
            .map_err(|e| IsolationError::spawn("egress proxy", e))?;

        let network = vm.record.tap_index.map(|index| GuestNetwork {
            tap_name: tap_name(&settings.tap_prefix, index),
            mac: guest_mac(index),
            guest_ip: guest_ip(&settings.bridge_subnet, index),
            gateway_ip: settings.gateway_ip(),
            dns: settings.dns_server.clone(),
        });
        let launch = LaunchSpec {
            definition,
            mounts: &mounts,
            fs_sockets,
            api_socket: vm.paths.api_socket(),
            vsock_socket: vm.paths.vsock_socket(),
            cid: vm.record.cid,
            session_hint,
            network: network.clone(),
        };
        let mut command = format!(
            "echo $$ > {}; exec {}",
            shell_quote(&vm.paths.pid_file().to_string_lossy()),
            shell_quote(&settings.supervisor_binary.to_string_lossy())
        );
        for arg in launch.supervisor_args() {
            command.push(' ');
            command.push_str(&shell_quote(&arg));
        }
        vm.session.spawn(&command).await?;
        tracing::debug!(session = %vm.session.name(), "supervisor launched");

        if !wait_for_path(&vm.paths.api_socket(), API_SOCKET_POLL, API_SOCKET_TIMEOUT).await {
            let diagnostics = vm.session.capture_tail(CONSOLE_TAIL_LINES).await;
            return Err(IsolationError::ReadinessTimeout {
                what: "supervisor API socket".to_string(),
                waited: API_SOCKET_TIMEOUT,
                diagnostics,
            });
        }

        match read_pid_file(&vm.paths.pid_file()) {
            Some(pid) => {
                vm.supervisor = Some(SupervisedProcess::adopt("cloud-hypervisor", pid));
                vm.record.supervisor_pid = Some(pid);
                self.place_in_cgroup(vm, pid);
            }
            None => tracing::warn!(handle = %vm.handle(), "supervisor pid file missing"),
        }

        if let Some(net) = network {
            let device = settings.sysfs_net_dir.join(&net.tap_name);
            if !wait_for_path(&device, TAP_POLL, TAP_TIMEOUT).await {
                return Err(IsolationError::ReadinessTimeout {
                    what: format!("TAP device {}", net.tap_name),
                    waited: TAP_TIMEOUT,
                    diagnostics: vm.session.capture_tail(CONSOLE_TAIL_LINES).await,
                });
            }
            self.net_helper.attach(&net.tap_name, &settings.bridge_name).await?;
        }

        vm.record.virtiofsd_pids = vm.virtiofsd.iter().map(SupervisedProcess::pid).collect();
        vm.record.write(&vm.paths)?;
        Ok(())
    }

    fn place_in_cgroup(&self, vm: &mut RunningVm, pid: u32) {
        let Some(cgroups) = &self.cgroups else {
            return;
        };
        let name = agent_key(&vm.record.agent_id);
        let definition = &vm.record.definition;
        let limits = ResourceLimits::for_vm(definition.memory_mb, definition.vcpu_count);
        if let Err(e) = cgroups.create(&name, &limits) {
            tracing::warn!(cgroup = %name, error = %e, "failed to create cgroup");
            return;
        }
        // Recorded before add_process so teardown removes the directory either way
        vm.cgroup = Some(name.clone());
        if let Err(e) = cgroups.add_process(&name, pid) {
            tracing::warn!(cgroup = %name, pid, error = %e, "failed to move supervisor into cgroup");
        }
    }

    /// Release everything `vm` holds; never fails
    async fn teardown(&self, mut vm: RunningVm) {
        let handle = vm.handle().clone();
        self.proxies.stop(handle.as_str()).await;

        let api_socket = vm.paths.api_socket();
        if api_socket.exists() && (vm.supervisor.is_none() || vm.is_alive()) {
            match SupervisorClient::new(&api_socket)
                .shutdown(API_REQUEST_TIMEOUT)
                .await
            {
                Ok(()) => {
                    if let Some(supervisor) = vm.supervisor.as_mut() {
                        supervisor.wait_for_exit(SHUTDOWN_GRACE).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(handle = %handle, step = "graceful shutdown", error = %e, "teardown step failed")
                }
            }
        }

        vm.session.kill().await;
        for daemon in vm.virtiofsd.iter_mut() {
            daemon.kill(KILL_GRACE).await;
        }
        if let Some(supervisor) = vm.supervisor.as_mut() {
            supervisor.kill(KILL_GRACE).await;
        }

        if let (Some(cgroups), Some(name)) = (&self.cgroups, vm.cgroup.as_deref()) {
            if let Err(e) = cgroups.destroy(name) {
                tracing::warn!(handle = %handle, step = "cgroup", cgroup = name, error = %e, "teardown step failed");
            }
        }
        if let Some(index) = vm.record.tap_index {
            self.allocator.lock().await.release_tap(index);
        }
        remove_runtime_dir(&handle, &vm.paths.runtime_dir);
        tracing::info!(handle = %handle, agent_id = %vm.record.agent_id, "vm torn down");
    }

    /// Rebuild in-memory state from a record left by an earlier process.
    ///
    /// Recorded PIDs are only trusted while their command line still
    /// mentions this VM's runtime directory.
    fn adopt(&self, paths: VmPaths, record: VmRecord) -> RunningVm {
        let owned = |pid: &u32| cmdline_mentions(*pid, &paths.runtime_dir);
        let supervisor = record
            .supervisor_pid
            .filter(owned)
            .map(|pid| SupervisedProcess::adopt("cloud-hypervisor", pid));
        let virtiofsd = record
            .virtiofsd_pids
            .iter()
            .filter(|pid| owned(pid))
            .map(|pid| SupervisedProcess::adopt("virtiofsd", *pid))
            .collect();
        let name = agent_key(&record.agent_id);
        let cgroup = self
            .cgroups
            .as_ref()
            .filter(|c| c.exists(&name))
            .map(|_| name);
        RunningVm {
            session: self.session_for(&record.agent_id),
            record,
            paths,
            supervisor,
            virtiofsd,
            cgroup,
        }
    }

    /// Tear down a VM known only from its record. Its TAP index was never
    /// claimed by this process and may already belong to a live VM.
    async fn discard_recorded(&self, paths: VmPaths, record: VmRecord) {
        let mut vm = self.adopt(paths, record);
        vm.record.tap_index = None;
        self.teardown(vm).await;
    }

    async fn lookup<T>(&self, handle: &EnvironmentHandle, f: impl FnOnce(&mut RunningVm) -> T) -> Option<T> {
        self.vms.lock().await.get_mut(handle).map(f)
    }
}

/// Last teardown step; a missing directory is fine, other failures are logged
fn remove_runtime_dir(handle: &EnvironmentHandle, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(handle = %handle, step = "runtime dir", error = %e, "teardown step failed")
        }
    }
}

#[async_trait]
impl IsolationAdapter for VmAdapter {
    fn backend_type(&self) -> &'static str {
        VM
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn is_available(&self) -> bool {
        let binaries = [
            &self.settings.supervisor_binary,
            &self.settings.virtiofsd_binary,
            &self.settings.multiplexer_binary,
        ];
        for binary in binaries {
            if which::which(binary).is_err() {
                tracing::debug!(binary = %binary.display(), "vm backend unavailable: binary not found");
                return false;
            }
        }
        if !Path::new("/dev/kvm").exists() {
            tracing::debug!("vm backend unavailable: /dev/kvm missing");
            return false;
        }
        true
    }

    async fn display_info(&self, definition_file: Option<&Path>) -> Result<DisplayInfo> {
        let definition = VmDefinition::load(definition_file)?;
        let name = definition_file
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| VM.to_string());
        Ok(DisplayInfo {
            name,
            description: "cloud-hypervisor microVM with a virtio-fs workspace".to_string(),
            limits: definition.limits(),
        })
    }

    async fn create(
        &self,
        definition_file: Option<&Path>,
        workspace_path: &Path,
        agent_id: &str,
        session_hint: Option<&str>,
    ) -> Result<CreatedEnvironment> {
        let handle = EnvironmentHandle::new(format!("vm-{}", Uuid::now_v7()));
        let span = tracing::info_span!("vm.create", agent_id, vm_id = %handle);

        async move {
            // Nothing is started before the definition is known to be valid
            let definition = VmDefinition::load(definition_file)?;
            let paths = self.paths_for(agent_id);
            let session = self.session_for(agent_id);
            self.preflight(agent_id, &paths, &session).await?;

            let allocation = match self.allocate().await {
                Ok(allocation) => allocation,
                Err(e) => {
                    remove_runtime_dir(&handle, &paths.runtime_dir);
                    return Err(e);
                }
            };
            let started = Instant::now();
            tracing::info!(cid = allocation.cid, tap = ?allocation.tap_index, "allocated VM identities");

            let mut vm = RunningVm {
                record: VmRecord {
                    handle: handle.clone(),
                    agent_id: agent_id.to_string(),
                    cid: allocation.cid,
                    tap_index: allocation.tap_index,
                    workspace_path: workspace_path.to_path_buf(),
                    definition,
                    supervisor_pid: None,
                    virtiofsd_pids: Vec::new(),
                },
                paths,
                session,
                supervisor: None,
                virtiofsd: Vec::new(),
                cgroup: None,
            };

            if let Err(e) = self.boot(&mut vm, session_hint).await {
                tracing::warn!(error = %e, "vm boot failed, tearing down");
                self.teardown(vm).await;
                return Err(e);
            }

            VM_BOOT_DURATION.observe(started.elapsed().as_secs_f64());
            tracing::info!(boot_secs = started.elapsed().as_secs_f64(), "vm running");
            self.vms.lock().await.insert(handle.clone(), vm);

            Ok(CreatedEnvironment {
                handle: handle.clone(),
                proxy_port: u16::try_from(self.settings.proxy_vsock_port).ok(),
            })
        }
        .instrument(span)
        .await
    }

    async fn exec(&self, handle: &EnvironmentHandle, command: &str) -> Result<String> {
        let target = self
            .lookup(handle, |vm| {
                (vm.paths.vsock_socket(), vm.record.definition.environment.clone())
            })
            .await;
        let Some((vsock_socket, env)): Option<(PathBuf, BTreeMap<String, String>)> = target else {
            return Err(IsolationError::Exec(format!("unknown VM handle '{}'", handle)));
        };
        ControlClient::new(vsock_socket, self.settings.control_vsock_port)
            .exec(command, &env)
            .await
    }

    async fn destroy(&self, handle: &EnvironmentHandle) {
        let tracked = self.vms.lock().await.remove(handle);
        if let Some(vm) = tracked {
            self.teardown(vm).await;
            return;
        }
        // A VM from an earlier process that was never re-adopted
        let recorded = load_records(&self.settings.runtime_dir)
            .into_iter()
            .find(|(_, record)| &record.handle == handle);
        match recorded {
            Some((paths, record)) => self.discard_recorded(paths, record).await,
            None => tracing::debug!(handle = %handle, "destroy of unknown VM handle ignored"),
        }
    }

    async fn stats(&self, handle: &EnvironmentHandle) -> Result<Option<EnvironmentStats>> {
        let Some(cgroups) = &self.cgroups else {
            return Ok(None);
        };
        let Some(Some(name)) = self.lookup(handle, |vm| vm.cgroup.clone()).await else {
            return Ok(None);
        };

        let sample = || cgroups.get_cpu_stats(&name);
        let (Ok(memory), Ok(before)) = (cgroups.get_memory_usage(&name), sample()) else {
            return Ok(None);
        };
        let started = Instant::now();
        tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
        let Ok(after) = sample() else {
            return Ok(None);
        };
        let elapsed_usec = started.elapsed().as_micros() as u64;

        Ok(Some(EnvironmentStats {
            memory_mb: memory as f64 / (1024.0 * 1024.0),
            cpu_percent: cpu_percent(&before, &after, elapsed_usec),
        }))
    }

    async fn shell_attach_command(
        &self,
        handle: &EnvironmentHandle,
        _workspace_path: &Path,
    ) -> Result<Option<ShellSpec>> {
        Ok(self
            .lookup(handle, |vm| ShellSpec {
                program: vm.session.binary().display().to_string(),
                args: vec![
                    "attach-session".to_string(),
                    "-t".to_string(),
                    vm.session.name().to_string(),
                ],
                cwd: None,
            })
            .await)
    }

    async fn cleanup_by_workspace(&self, workspace_path: &Path) -> Result<()> {
        let handles: Vec<EnvironmentHandle> = self
            .vms
            .lock()
            .await
            .values()
            .filter(|vm| vm.record.workspace_path == workspace_path)
            .map(|vm| vm.handle().clone())
            .collect();
        for handle in &handles {
            self.destroy(handle).await;
        }

        for (paths, record) in load_records(&self.settings.runtime_dir) {
            if record.workspace_path == workspace_path && !handles.contains(&record.handle) {
                tracing::info!(handle = %record.handle, workspace = %workspace_path.display(), "removing untracked VM for workspace");
                self.discard_recorded(paths, record).await;
            }
        }
        Ok(())
    }

    async fn probe(
        &self,
        handle: &EnvironmentHandle,
        agent_id: &str,
        _workspace_path: &Path,
    ) -> HandleState {
        if let Some(alive) = self.lookup(handle, |vm| vm.is_alive()).await {
            return if alive {
                HandleState::Running
            } else {
                HandleState::Stopped
            };
        }

        let paths = self.paths_for(agent_id);
        let record = match VmRecord::read(&paths) {
            Some(record) if &record.handle == handle => record,
            _ => return HandleState::Gone,
        };

        let mut vm = self.adopt(paths, record);
        if !vm.is_alive() {
            tracing::info!(handle = %handle, "recorded VM is no longer running, cleaning up");
            // The dead VM's TAP index may already belong to someone else
            vm.record.tap_index = None;
            self.teardown(vm).await;
            return HandleState::Gone;
        }

        {
            let mut allocator = self.allocator.lock().await;
            allocator.observe_cid(vm.record.cid);
            if let Some(index) = vm.record.tap_index {
                allocator.claim_tap(index);
            }
        }
        let definition = &vm.record.definition;
        let policy = DomainPolicy::new(&definition.allowed_domains, definition.allow_all_traffic);
        if let Err(e) = self
            .proxies
            .start(
                handle.as_str(),
                ProxyEndpoint::Unix(vm.paths.vsock_listener(self.settings.proxy_vsock_port)),
                policy,
            )
            .await
        {
            tracing::warn!(handle = %handle, error = %e, "failed to restart egress proxy for re-adopted VM");
        }
        tracing::info!(handle = %handle, cid = vm.record.cid, "re-adopted running VM");
        self.vms.lock().await.insert(handle.clone(), vm);
        HandleState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::allocator::ResourceAllocator;

    fn adapter(dir: &Path) -> VmAdapter {
        let settings = Settings {
            state_dir: dir.join("state"),
            runtime_dir: dir.join("run"),
            sysfs_net_dir: dir.join("sys"),
            multiplexer_binary: PathBuf::from("/nonexistent/tmux"),
            ..Settings::default()
        };
        let allocator = ResourceAllocator::new(dir.join("sys"), "tap").shared();
        VmAdapter::new(settings, allocator)
    }

    fn record(agent: &str, handle: &str, workspace: &Path) -> VmRecord {
        VmRecord {
            handle: EnvironmentHandle::new(handle),
            agent_id: agent.to_string(),
            cid: 42,
            tap_index: None,
            workspace_path: workspace.to_path_buf(),
            definition: VmDefinition::default(),
            supervisor_pid: None,
            virtiofsd_pids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_invalid_definition_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let err = vm
            .create(Some(&dir.path().join("missing.json")), dir.path(), "agent-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::Definition { .. }));
        assert!(!vm.paths_for("agent-1").runtime_dir.exists());
    }

    #[tokio::test]
    async fn test_destroy_unknown_handle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let handle = EnvironmentHandle::new("vm-unknown");
        vm.destroy(&handle).await;
        vm.destroy(&handle).await;
        assert!(vm.exec(&handle, "true").await.is_err());
        assert_eq!(vm.stats(&handle).await.unwrap(), None);
        assert_eq!(vm.shell_attach_command(&handle, dir.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_probe_without_record_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let state = vm
            .probe(&EnvironmentHandle::new("vm-x"), "agent-1", dir.path())
            .await;
        assert_eq!(state, HandleState::Gone);
    }

    #[tokio::test]
    async fn test_probe_dead_record_cleans_runtime_dir() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let paths = vm.paths_for("agent-1");
        std::fs::create_dir_all(&paths.runtime_dir).unwrap();
        record("agent-1", "vm-dead", dir.path()).write(&paths).unwrap();

        // Handle mismatch: the record belongs to another VM
        let other = vm
            .probe(&EnvironmentHandle::new("vm-other"), "agent-1", dir.path())
            .await;
        assert_eq!(other, HandleState::Gone);
        assert!(paths.runtime_dir.exists());

        let state = vm
            .probe(&EnvironmentHandle::new("vm-dead"), "agent-1", dir.path())
            .await;
        assert_eq!(state, HandleState::Gone);
        assert!(!paths.runtime_dir.exists());
    }

    #[tokio::test]
    async fn test_recorded_cids_are_never_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let paths = VmPaths::new(dir.path().join("run").join("old-agent"));
        std::fs::create_dir_all(&paths.runtime_dir).unwrap();
        record("old-agent", "vm-old", dir.path()).write(&paths).unwrap();

        let allocation = vm.allocate().await.unwrap();
        assert!(allocation.cid > 42);
        assert_eq!(allocation.tap_index, None);
    }

    #[tokio::test]
    async fn test_cleanup_by_workspace_removes_recorded_vm() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let workspace = dir.path().join("ws");
        let paths = VmPaths::new(dir.path().join("run").join("agent-7"));
        std::fs::create_dir_all(&paths.runtime_dir).unwrap();
        record("agent-7", "vm-7", &workspace).write(&paths).unwrap();

        vm.cleanup_by_workspace(&dir.path().join("elsewhere")).await.unwrap();
        assert!(paths.runtime_dir.exists());
        vm.cleanup_by_workspace(&workspace).await.unwrap();
        assert!(!paths.runtime_dir.exists());
    }

    #[tokio::test]
    async fn test_recorded_vm_teardown_leaves_tap_claims_alone() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let live = vm.allocator.lock().await.allocate(true).unwrap();
        assert_eq!(live.tap_index, Some(0));

        // Records from an earlier process that happen to name the live index
        let workspace = dir.path().join("ws");
        for (agent, handle) in [("old-a", "vm-old-a"), ("old-b", "vm-old-b")] {
            let paths = vm.paths_for(agent);
            std::fs::create_dir_all(&paths.runtime_dir).unwrap();
            let mut stale = record(agent, handle, &workspace);
            stale.tap_index = Some(0);
            stale.write(&paths).unwrap();
        }

        vm.destroy(&EnvironmentHandle::new("vm-old-a")).await;
        assert!(!vm.paths_for("old-a").runtime_dir.exists());
        let next = vm.allocator.lock().await.allocate(true).unwrap();
        assert_eq!(next.tap_index, Some(1));

        vm.cleanup_by_workspace(&workspace).await.unwrap();
        assert!(!vm.paths_for("old-b").runtime_dir.exists());
        let last = vm.allocator.lock().await.allocate(true).unwrap();
        assert_eq!(last.tap_index, Some(2));
    }

    #[tokio::test]
    async fn test_preflight_clears_crashed_vm_but_not_neighbour() {
        let dir = tempfile::tempdir().unwrap();
        let vm = adapter(dir.path());
        let paths = vm.paths_for("agent-1");
        // Sanitizes to the same text as agent-1
        let neighbour = vm.paths_for("agent.1");
        assert_ne!(paths.runtime_dir, neighbour.runtime_dir);
        assert_ne!(vm.session_for("agent-1").name(), vm.session_for("agent.1").name());

        for (agent, handle, p) in [("agent-1", "vm-crashed", &paths), ("agent.1", "vm-live", &neighbour)] {
            std::fs::create_dir_all(&p.runtime_dir).unwrap();
            record(agent, handle, dir.path()).write(p).unwrap();
        }
        // Stand-ins for a supervisor whose command line names its runtime dir
        let stand_in = |runtime: &Path| {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("sleep 30; : ").arg(runtime.to_string_lossy().to_string());
            SupervisedProcess::spawn("sh", &mut cmd).unwrap()
        };
        let mut stale = stand_in(&paths.runtime_dir);
        let mut live = stand_in(&neighbour.runtime_dir);

        let session = vm.session_for("agent-1");
        vm.preflight("agent-1", &paths, &session).await.unwrap();

        assert!(stale.wait_for_exit(Duration::from_secs(2)).await);
        assert!(paths.runtime_dir.is_dir());
        assert_eq!(std::fs::read_dir(&paths.runtime_dir).unwrap().count(), 0);

        assert!(live.is_alive());
        assert!(VmRecord::read(&neighbour).is_some());
        live.kill(Duration::from_secs(2)).await;
    }

    #[test]
    fn test_remove_runtime_dir_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = EnvironmentHandle::new("vm-r");
        let runtime = dir.path().join("agent");
        std::fs::create_dir_all(runtime.join("nested")).unwrap();
        std::fs::write(runtime.join("vm.json"), "{}").unwrap();

        remove_runtime_dir(&handle, &runtime);
        assert!(!runtime.exists());
        remove_runtime_dir(&handle, &runtime);
        // A plain file is not a directory; the failure is logged, not raised
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        remove_runtime_dir(&handle, &file);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_display_info_lists_limits() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("small.json");
        std::fs::write(&def, r#"{"kernelPath": "/k", "rootfsPath": "/r", "memoryMB": 2048}"#).unwrap();
        let info = adapter(dir.path()).display_info(Some(&def)).await.unwrap();
        assert_eq!(info.name, "small");
        assert!(info.limits.contains(&"memory 2048MB".to_string()));
        assert!(info.limits.contains(&"egress: none".to_string()));
    }
}
