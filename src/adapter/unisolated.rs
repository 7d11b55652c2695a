//! No-isolation backend
//!
//! Runs commands directly on the host inside the workspace directory. Nothing
//! is allocated: the handle is derived from the agent id and a sanitized
//! workspace path, and the adapter only remembers which directory it maps to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{
    sanitize_id, Capability, CreatedEnvironment, DisplayInfo, EnvironmentHandle, HandleState,
    IsolationAdapter,
};
use crate::error::{IsolationError, Result};

/// Backend type string; also the config name that is always available
pub const UNISOLATED: &str = "unisolated";

/// Upper bound on a single host command
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Adapter that executes on the host without any isolation
#[derive(Debug, Default)]
pub struct UnisolatedAdapter {
    workspaces: Mutex<HashMap<EnvironmentHandle, PathBuf>>,
}

impl UnisolatedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_for(agent_id: &str, workspace_path: &Path) -> EnvironmentHandle {
        EnvironmentHandle::new(format!(
            "local:{}:{}",
            agent_id,
            sanitize_id(&workspace_path.to_string_lossy())
        ))
    }
}

#[async_trait]
impl IsolationAdapter for UnisolatedAdapter {
    fn backend_type(&self) -> &'static str {
        UNISOLATED
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::LiveProbe]
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn display_info(&self, _definition_file: Option<&Path>) -> Result<DisplayInfo> {
        Ok(DisplayInfo {
            name: "Unisolated".to_string(),
            description: "Commands run directly on the host".to_string(),
            limits: Vec::new(),
        })
    }

    async fn create(
        &self,
        _definition_file: Option<&Path>,
        workspace_path: &Path,
        agent_id: &str,
        _session_hint: Option<&str>,
    ) -> Result<CreatedEnvironment> {
        let handle = Self::handle_for(agent_id, workspace_path);
        self.workspaces
            .lock()
            .await
            .insert(handle.clone(), workspace_path.to_path_buf());
        tracing::debug!(agent_id, %handle, "unisolated environment registered");
        Ok(CreatedEnvironment::new(handle))
    }

    async fn exec(&self, handle: &EnvironmentHandle, command: &str) -> Result<String> {
        let cwd = self
            .workspaces
            .lock()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| IsolationError::Exec(format!("unknown handle {}", handle)))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(EXEC_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(IsolationError::Exec(format!("{}: {}", handle, e))),
            Err(_) => {
                return Err(IsolationError::Exec(format!(
                    "{}: command timed out after {:?}",
                    handle, EXEC_TIMEOUT
                )))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn destroy(&self, handle: &EnvironmentHandle) {
        self.workspaces.lock().await.remove(handle);
    }

    async fn probe(
        &self,
        handle: &EnvironmentHandle,
        _agent_id: &str,
        workspace_path: &Path,
    ) -> HandleState {
        if !workspace_path.is_dir() {
            return HandleState::Gone;
        }
        self.workspaces
            .lock()
            .await
            .insert(handle.clone(), workspace_path.to_path_buf());
        HandleState::Running
    }
}
