//! Host processes that make up one VM
//!
//! ```text
//! tmux session agentvisor-<agent>
//! └── sh -c 'echo $$ > supervisor.pid; exec cloud-hypervisor ...'
//! virtiofsd (one per share, direct children)
//! ```
//!
//! [`SupervisedProcess`] covers both kinds: a direct child keeps its tokio
//! `Child` so it can be reaped, an adopted PID is signalled by number only.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{IsolationError, Result};

/// Interval between liveness checks while waiting for a signalled process
const EXIT_POLL: Duration = Duration::from_millis(50);
/// Upper bound for a single multiplexer CLI call
const MULTIPLEXER_TIMEOUT: Duration = Duration::from_secs(5);

/// A host process owned by one VM
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    name: String,
    child: Option<Child>,
}

impl SupervisedProcess {
    /// Spawn `cmd` as a direct child
    pub fn spawn(name: impl Into<String>, cmd: &mut Command) -> Result<Self> {
        let name = name.into();
        let child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| IsolationError::spawn(&name, e))?;
        let pid = child
            .id()
            .ok_or_else(|| IsolationError::spawn(&name, "process exited before its pid was read"))?;
        Ok(Self {
            pid,
            name,
            child: Some(child),
        })
    }

    /// Track a process this orchestrator did not start
    pub fn adopt(name: impl Into<String>, pid: u32) -> Self {
        Self {
            pid,
            name: name.into(),
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => pid_alive(self.pid),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Never fails; problems are logged with the process name.
    pub async fn kill(&mut self, grace: Duration) {
        if !self.is_alive() {
            self.reap().await;
            return;
        }
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            tracing::debug!(process = %self.name, pid = self.pid, error = %e, "SIGTERM failed");
        }
        if self.wait_for_exit(grace).await {
            self.reap().await;
            return;
        }

        tracing::warn!(process = %self.name, pid = self.pid, "did not exit after SIGTERM, sending SIGKILL");
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            tracing::debug!(process = %self.name, pid = self.pid, error = %e, "SIGKILL failed");
        }
        self.wait_for_exit(grace).await;
        self.reap().await;
    }

    /// Poll until the process is gone or `timeout` elapses
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    async fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

/// `kill(pid, 0)` liveness check
pub fn pid_alive(pid: u32) -> bool {
    pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll for `path` to exist, bounded by `timeout`
///
/// Uses `tokio::time` throughout so paused-clock tests drive it.
pub async fn wait_for_path(path: &Path, poll: Duration, timeout: Duration) -> bool {
    let probe = async {
        loop {
            if path.exists() {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(timeout, probe).await.is_ok()
}

/// Read a PID written by `echo $$ > file`
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Quote one argument for `sh -c`
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ',' | ':'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Kill every process whose command line mentions `needle`
///
/// Used before a VM boots to clear supervisors and virtiofs daemons left
/// behind by a crashed orchestrator. Programs named in `spare` are skipped:
/// a multiplexer server forked by `new-session` keeps that command line and
/// hosts every other agent's console. Returns how many processes were found.
pub async fn kill_processes_referencing(needle: &Path, spare: &[&str], grace: Duration) -> usize {
    let needle = needle.to_string_lossy().into_owned();
    let me = std::process::id();
    let mut victims = Vec::new();

    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "cannot scan /proc");
            return 0;
        }
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        let program = first_word(&cmdline);
        if mentions_path(&cmdline, &needle) && !spare.contains(&program.as_str()) {
            victims.push(SupervisedProcess::adopt(program, pid));
        }
    }

    let count = victims.len();
    for mut victim in victims {
        tracing::info!(process = %victim.name(), pid = victim.pid(), "killing stale process");
        victim.kill(grace).await;
    }
    count
}

/// True when the live process `pid` has `needle` on its command line.
///
/// Guards re-adoption of recorded PIDs against PID reuse.
pub fn cmdline_mentions(pid: u32, needle: &Path) -> bool {
    let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };
    let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
    mentions_path(&cmdline, &needle.to_string_lossy())
}

/// True when `needle` occurs in `haystack` as a whole path, so that
/// `/run/av/agent-1` does not match `/run/av/agent-10`
fn mentions_path(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(at, _)| {
        haystack[at + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '-' || c == '_'))
    })
}

fn first_word(cmdline: &str) -> String {
    cmdline
        .split_whitespace()
        .next()
        .and_then(|w| Path::new(w).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "process".to_string())
}

/// A detached terminal-multiplexer session hosting the supervisor console
#[derive(Debug, Clone)]
pub struct MultiplexerSession {
    binary: PathBuf,
    name: String,
}

impl MultiplexerSession {
    pub fn new(binary: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let program = self.binary.display().to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(MULTIPLEXER_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => Err(IsolationError::spawn(program, e)),
            Err(_) => Err(IsolationError::spawn(program, "timed out")),
        }
    }

    /// Start a detached session running `shell_command`
    pub async fn spawn(&self, shell_command: &str) -> Result<()> {
        let out = self
            .run(&["new-session", "-d", "-s", &self.name, "-x", "200", "-y", "50", shell_command])
            .await?;
        if !out.status.success() {
            return Err(IsolationError::spawn(
                self.binary.display().to_string(),
                String::from_utf8_lossy(&out.stderr).trim(),
            ));
        }
        Ok(())
    }

    /// Last `lines` lines of the session's pane, if it still exists
    pub async fn capture_tail(&self, lines: u32) -> Option<String> {
        let start = format!("-{}", lines);
        match self
            .run(&["capture-pane", "-p", "-t", &self.name, "-S", &start])
            .await
        {
            Ok(out) if out.status.success() => {
                Some(String::from_utf8_lossy(&out.stdout).into_owned())
            }
            _ => None,
        }
    }

    /// Kill the session; a missing session is not an error
    pub async fn kill(&self) {
        match self.run(&["kill-session", "-t", &self.name]).await {
            Ok(out) if out.status.success() => {
                tracing::debug!(session = %self.name, "multiplexer session killed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(session = %self.name, error = %e, "failed to kill multiplexer session"),
        }
    }
}
