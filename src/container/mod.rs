//! Container backend
//!
//! Drives a docker-compatible engine CLI. Every container is created detached
//! with the hardening flags from [`args::run_args`] and labelled so that it can
//! be found again by label alone after a crash.

pub mod args;
pub mod definition;
pub mod stats;

pub use definition::ContainerDefinition;

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::Instrument;

use crate::adapter::{
    Capability, CreatedEnvironment, DisplayInfo, EnvironmentHandle, EnvironmentStats,
    HandleState, IsolationAdapter, ManagedEnvironment, ShellSpec,
};
use crate::error::{IsolationError, Result};
use args::{
    container_name, container_user, managed_filter, run_args, RunContext, LABEL_AGENT_ID,
    LABEL_WORKSPACE, WORKSPACE_MOUNT,
};

pub const CONTAINER: &str = "container";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RUN_TIMEOUT: Duration = Duration::from_secs(120);
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const STATS_TIMEOUT: Duration = Duration::from_secs(10);

/// Adapter for docker / podman
#[derive(Debug, Clone)]
pub struct ContainerAdapter {
    engine: String,
}

impl ContainerAdapter {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Run the engine CLI with a bound on wall-clock time
    async fn engine_output(&self, args: &[String], timeout: Duration) -> Result<Output> {
        let mut cmd = Command::new(&self.engine);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(IsolationError::spawn(&self.engine, e)),
            Err(_) => Err(IsolationError::spawn(
                &self.engine,
                format!("{} timed out after {:?}", args.first().map(String::as_str).unwrap_or(""), timeout),
            )),
        }
    }

    async fn remove(&self, target: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), target.to_string()];
        match self.engine_output(&args, REMOVE_TIMEOUT).await {
            Ok(out) if out.status.success() => {
                tracing::debug!(container = target, "container removed");
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.contains("No such container") {
                    tracing::warn!(container = target, stderr = %stderr.trim(), "container removal failed");
                }
            }
            Err(e) => tracing::warn!(container = target, error = %e, "container removal failed"),
        }
    }

    async fn ids_with_label(&self, filter: String) -> Result<Vec<String>> {
        let args = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            filter,
        ];
        let out = self.engine_output(&args, PROBE_TIMEOUT).await?;
        if !out.status.success() {
            return Err(IsolationError::spawn(
                &self.engine,
                String::from_utf8_lossy(&out.stderr).trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

impl Default for ContainerAdapter {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Parse `ps` output in the `id\tagent\tworkspace` format used by `list_managed`
fn parse_managed_listing(stdout: &str) -> Vec<ManagedEnvironment> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let non_empty = |s: Option<&str>| {
                s.map(str::trim)
                    .filter(|v| !v.is_empty() && *v != "<no value>")
                    .map(String::from)
            };
            let agent_id = non_empty(fields.next());
            let workspace_path = non_empty(fields.next()).map(Into::into);
            Some(ManagedEnvironment {
                handle: EnvironmentHandle::new(id),
                agent_id,
                workspace_path,
            })
        })
        .collect()
}

#[async_trait]
impl IsolationAdapter for ContainerAdapter {
    fn backend_type(&self) -> &'static str {
        CONTAINER
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Stats,
            Capability::ShellAttach,
            Capability::WorkspaceCleanup,
            Capability::OrphanListing,
            Capability::LiveProbe,
        ]
    }

    async fn is_available(&self) -> bool {
        let args = vec!["info".to_string()];
        match self.engine_output(&args, PROBE_TIMEOUT).await {
            Ok(out) => out.status.success(),
            Err(e) => {
                tracing::debug!(engine = %self.engine, error = %e, "container engine probe failed");
                false
            }
        }
    }

    async fn display_info(&self, definition_file: Option<&Path>) -> Result<DisplayInfo> {
        let def = ContainerDefinition::load(definition_file)?;
        Ok(DisplayInfo {
            name: def.image.clone(),
            description: format!("Hardened {} container", self.engine),
            limits: def.limits(),
        })
    }

    async fn create(
        &self,
        definition_file: Option<&Path>,
        workspace_path: &Path,
        agent_id: &str,
        _session_hint: Option<&str>,
    ) -> Result<CreatedEnvironment> {
        let span = tracing::info_span!("container.create", agent_id, engine = %self.engine);
        async move {
            let def = ContainerDefinition::load(definition_file)?;
            let ctx = RunContext {
                agent_id,
                workspace: workspace_path,
                home: dirs::home_dir(),
                user: container_user(
                    nix::unistd::getuid().as_raw(),
                    nix::unistd::getgid().as_raw(),
                ),
            };
            let name = container_name(agent_id);

            // A container left over from a crashed process would block the name
            self.remove(&name).await;

            let started = Instant::now();
            let out = self.engine_output(&run_args(&def, &ctx), RUN_TIMEOUT).await?;
            if !out.status.success() {
                self.remove(&name).await;
                return Err(IsolationError::spawn(
                    format!("{} run", self.engine),
                    String::from_utf8_lossy(&out.stderr).trim(),
                ));
            }

            let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if id.is_empty() {
                self.remove(&name).await;
                return Err(IsolationError::spawn(
                    format!("{} run", self.engine),
                    "engine returned no container id",
                ));
            }

            tracing::info!(
                container = %id,
                image = %def.image,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "container started"
            );
            Ok(CreatedEnvironment::new(EnvironmentHandle::new(id)))
        }
        .instrument(span)
        .await
    }

    async fn exec(&self, handle: &EnvironmentHandle, command: &str) -> Result<String> {
        let args = vec![
            "exec".to_string(),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
            handle.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        let out = self
            .engine_output(&args, EXEC_TIMEOUT)
            .await
            .map_err(|e| IsolationError::Exec(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() && stdout.is_empty() && stderr.starts_with("Error") {
            return Err(IsolationError::Exec(stderr.trim().to_string()));
        }
        Ok(format!("{}{}", stdout, stderr))
    }

    async fn destroy(&self, handle: &EnvironmentHandle) {
        self.remove(handle.as_str()).await;
    }

    async fn stats(&self, handle: &EnvironmentHandle) -> Result<Option<EnvironmentStats>> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            stats::STATS_FORMAT.to_string(),
            handle.to_string(),
        ];
        let out = match self.engine_output(&args, STATS_TIMEOUT).await {
            Ok(out) if out.status.success() => out,
            Ok(_) | Err(_) => return Ok(None),
        };
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout.lines().next().and_then(stats::parse_stats_line))
    }

    async fn shell_attach_command(
        &self,
        handle: &EnvironmentHandle,
        _workspace_path: &Path,
    ) -> Result<Option<ShellSpec>> {
        Ok(Some(ShellSpec {
            program: self.engine.clone(),
            args: vec![
                "exec".into(),
                "-it".into(),
                "-w".into(),
                WORKSPACE_MOUNT.into(),
                handle.to_string(),
                "/bin/bash".into(),
            ],
            cwd: None,
        }))
    }

    async fn cleanup_by_workspace(&self, workspace_path: &Path) -> Result<()> {
        let filter = format!("label={}={}", LABEL_WORKSPACE, workspace_path.display());
        for id in self.ids_with_label(filter).await? {
            tracing::info!(container = %id, workspace = %workspace_path.display(), "removing container for workspace");
            self.remove(&id).await;
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedEnvironment>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            managed_filter(),
            "--format".to_string(),
            format!(
                "{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}",
                LABEL_AGENT_ID, LABEL_WORKSPACE
            ),
        ];
        let out = self.engine_output(&args, PROBE_TIMEOUT).await?;
        if !out.status.success() {
            return Err(IsolationError::spawn(
                &self.engine,
                String::from_utf8_lossy(&out.stderr).trim(),
            ));
        }
        Ok(parse_managed_listing(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn probe(
        &self,
        handle: &EnvironmentHandle,
        _agent_id: &str,
        _workspace_path: &Path,
    ) -> HandleState {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            handle.to_string(),
        ];
        match self.engine_output(&args, PROBE_TIMEOUT).await {
            Ok(out) if out.status.success() => {
                match String::from_utf8_lossy(&out.stdout).trim() {
                    "true" => HandleState::Running,
                    "false" => HandleState::Stopped,
                    _ => HandleState::Unknown,
                }
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr).to_lowercase();
                if stderr.contains("no such") {
                    HandleState::Gone
                } else {
                    HandleState::Unknown
                }
            }
            Err(_) => HandleState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MISSING_ENGINE: &str = "/nonexistent/agentvisor-test-engine";

    #[test]
    fn test_parse_managed_listing() {
        let stdout = "abc123\tagent-1\t/work/a\n\
                      def456\t<no value>\t\n\
                      \n";
        let listed = parse_managed_listing(stdout);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].handle.as_str(), "abc123");
        assert_eq!(listed[0].agent_id.as_deref(), Some("agent-1"));
        assert_eq!(listed[0].workspace_path, Some(PathBuf::from("/work/a")));
        assert_eq!(listed[1].agent_id, None);
        assert_eq!(listed[1].workspace_path, None);
    }

    #[tokio::test]
    async fn test_missing_engine_is_unavailable() {
        let adapter = ContainerAdapter::new(MISSING_ENGINE);
        assert!(!adapter.is_available().await);
    }

    #[tokio::test]
    async fn test_destroy_never_fails() {
        let adapter = ContainerAdapter::new(MISSING_ENGINE);
        let handle = EnvironmentHandle::new("deadbeef");
        adapter.destroy(&handle).await;
        adapter.destroy(&handle).await;
    }

    #[tokio::test]
    async fn test_stats_without_engine_is_none() {
        let adapter = ContainerAdapter::new(MISSING_ENGINE);
        let stats = adapter.stats(&EnvironmentHandle::new("x")).await.unwrap();
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn test_shell_attach_uses_workspace() {
        let adapter = ContainerAdapter::new("podman");
        let spec = adapter
            .shell_attach_command(&EnvironmentHandle::new("c0ffee"), Path::new("/w"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spec.program, "podman");
        assert_eq!(spec.args, vec!["exec", "-it", "-w", "/workspace", "c0ffee", "/bin/bash"]);
    }

    #[tokio::test]
    async fn test_display_info_lists_limits() {
        let adapter = ContainerAdapter::default();
        let info = adapter.display_info(None).await.unwrap();
        assert_eq!(info.name, "debian:bookworm-slim");
        assert!(info.limits.contains(&"memory 4g".to_string()));
        assert!(info.limits.contains(&"read-only rootfs".to_string()));
    }
}
