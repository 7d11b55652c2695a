//! Per-VM bookkeeping
//!
//! Everything one VM owns on the host lives under its runtime directory,
//! keyed by the sanitized agent id:
//!
//! ```text
//! <runtime_dir>/<agent>/
//! ├── api.sock            supervisor REST API
//! ├── vsock.sock          hybrid vsock (host → guest CONNECT)
//! ├── vsock.sock_3128     guest → host connections on port 3128 (egress proxy)
//! ├── fs-<tag>.sock       one per virtiofsd
//! ├── supervisor.pid      written by the launch shell before exec
//! └── vm.json             VmRecord, read back after an orchestrator restart
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::definition::VmDefinition;
use super::process::{MultiplexerSession, SupervisedProcess};
use crate::adapter::EnvironmentHandle;
use crate::error::{IsolationError, Result};

const RECORD_FILE: &str = "vm.json";

/// Socket and file layout of one runtime directory
#[derive(Debug, Clone, PartialEq)]
pub struct VmPaths {
    pub runtime_dir: PathBuf,
}

impl VmPaths {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn api_socket(&self) -> PathBuf {
        self.runtime_dir.join("api.sock")
    }

    pub fn vsock_socket(&self) -> PathBuf {
        self.runtime_dir.join("vsock.sock")
    }

    /// Listener for guest-initiated connections to host `port`
    pub fn vsock_listener(&self, port: u32) -> PathBuf {
        self.runtime_dir.join(format!("vsock.sock_{}", port))
    }

    pub fn fs_socket(&self, tag: &str) -> PathBuf {
        self.runtime_dir.join(format!("fs-{}.sock", tag))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("supervisor.pid")
    }

    pub fn record_file(&self) -> PathBuf {
        self.runtime_dir.join(RECORD_FILE)
    }
}

/// What survives an orchestrator restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub handle: EnvironmentHandle,
    pub agent_id: String,
    pub cid: u32,
    pub tap_index: Option<u32>,
    pub workspace_path: PathBuf,
    pub definition: VmDefinition,
    pub supervisor_pid: Option<u32>,
    #[serde(default)]
    pub virtiofsd_pids: Vec<u32>,
}

impl VmRecord {
    pub fn write(&self, paths: &VmPaths) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| IsolationError::Store(format!("encode vm record: {}", e)))?;
        let target = paths.record_file();
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Read `vm.json`; a missing or unreadable record is `None`
    pub fn read(paths: &VmPaths) -> Option<Self> {
        let text = std::fs::read_to_string(paths.record_file()).ok()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %paths.record_file().display(), error = %e, "ignoring unreadable vm record");
                None
            }
        }
    }
}

/// Every record under `runtime_dir`, one per agent directory
pub fn load_records(runtime_dir: &Path) -> Vec<(VmPaths, VmRecord)> {
    let Ok(entries) = std::fs::read_dir(runtime_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let paths = VmPaths::new(e.path());
            VmRecord::read(&paths).map(|record| (paths, record))
        })
        .collect()
}

/// A booted VM tracked in memory
#[derive(Debug)]
pub struct RunningVm {
    pub record: VmRecord,
    pub paths: VmPaths,
    pub session: MultiplexerSession,
    pub supervisor: Option<SupervisedProcess>,
    pub virtiofsd: Vec<SupervisedProcess>,
    /// cgroup name when resource accounting is active
    pub cgroup: Option<String>,
}

impl RunningVm {
    pub fn handle(&self) -> &EnvironmentHandle {
        &self.record.handle
    }

    pub fn is_alive(&mut self) -> bool {
        self.supervisor.as_mut().is_some_and(SupervisedProcess::is_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(agent: &str, cid: u32) -> VmRecord {
        VmRecord {
            handle: EnvironmentHandle::new(format!("vm-{}", agent)),
            agent_id: agent.to_string(),
            cid,
            tap_index: Some(1),
            workspace_path: PathBuf::from("/work"),
            definition: VmDefinition::default(),
            supervisor_pid: Some(4242),
            virtiofsd_pids: vec![10, 11],
        }
    }

    #[test]
    fn test_layout() {
        let paths = VmPaths::new("/run/av/agent-1");
        assert_eq!(paths.vsock_listener(3128), PathBuf::from("/run/av/agent-1/vsock.sock_3128"));
        assert_eq!(paths.fs_socket("workspace"), PathBuf::from("/run/av/agent-1/fs-workspace.sock"));
    }

    #[test]
    fn test_load_records_skips_dirs_without_record() {
        let dir = tempfile::tempdir().unwrap();
        for (agent, cid) in [("a", 3), ("b", 9)] {
            let paths = VmPaths::new(dir.path().join(agent));
            std::fs::create_dir_all(&paths.runtime_dir).unwrap();
            record(agent, cid).write(&paths).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("vm.json"), "{not json").unwrap();

        let mut cids: Vec<u32> = load_records(dir.path()).into_iter().map(|(_, r)| r.cid).collect();
        cids.sort();
        assert_eq!(cids, vec![3, 9]);
    }

    #[test]
    fn test_missing_runtime_dir_has_no_records() {
        assert!(load_records(Path::new("/nonexistent/agentvisor")).is_empty());
    }
}
