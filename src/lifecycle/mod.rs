//! Lifecycle manager
//!
//! [`IsolationManager`] is the single owner of `agent id → EnvironmentInfo`.
//! It resolves configuration names, picks the adapter for the backend type,
//! persists the map and tells subscribers what changed.
//!
//! ```text
//!  create(config, workspace, agent)
//!     │
//!     ├─► ConfigDiscovery::resolve ──► IsolationConfigRef { type, file }
//!     ├─► AdapterRegistry::get(type) ──► is_available?
//!     ├─► adapter.create(...)
//!     └─► map + environments.json + LifecycleEvent::Created
//! ```
//!
//! Persisted state is only a hint: `restore()` asks every backend whether
//! the recorded handle is still alive before trusting it.

pub mod discovery;
pub mod events;
pub mod store;

pub use discovery::{ConfigDiscovery, FsConfigDiscovery, IsolationConfigRef};
pub use events::{EventBus, LifecycleEvent};
pub use store::{EnvironmentInfo, EnvironmentState, EnvironmentStore};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex};
use tracing::Instrument;

use crate::adapter::{
    AdapterRegistry, Capability, DisplayInfo, EnvironmentHandle, EnvironmentStats, HandleState,
    IsolationAdapter, ShellSpec, UnisolatedAdapter,
};
use crate::container::ContainerAdapter;
use crate::error::{IsolationError, Result};
use crate::metrics::{CREATE_DURATION, CREATE_FAILURES, ENVIRONMENTS_ACTIVE};
use crate::settings::Settings;
use crate::vm::{ResourceAllocator, VmAdapter};

/// Something on the host this system created but no longer tracks
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedEnvironment {
    pub backend_type: String,
    pub handle: EnvironmentHandle,
    pub agent_id: Option<String>,
    pub workspace_path: Option<PathBuf>,
}

/// Registry with the three built-in backends
pub fn default_registry(settings: &Settings) -> AdapterRegistry {
    let allocator =
        ResourceAllocator::new(settings.sysfs_net_dir.clone(), settings.tap_prefix.clone()).shared();
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(UnisolatedAdapter::new()));
    registry.register(Arc::new(ContainerAdapter::new(settings.container_engine.clone())));
    registry.register(Arc::new(
        VmAdapter::new(settings.clone(), allocator).with_host_cgroups(),
    ));
    registry
}

pub struct IsolationManager {
    registry: AdapterRegistry,
    discovery: Arc<dyn ConfigDiscovery>,
    store: EnvironmentStore,
    environments: Mutex<HashMap<String, EnvironmentInfo>>,
    events: EventBus,
}

impl IsolationManager {
    pub fn new(
        registry: AdapterRegistry,
        discovery: Arc<dyn ConfigDiscovery>,
        store: EnvironmentStore,
    ) -> Self {
        Self {
            registry,
            discovery,
            store,
            environments: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    /// Built-in backends, filesystem discovery and the store under `state_dir`
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            default_registry(settings),
            Arc::new(FsConfigDiscovery::new()),
            EnvironmentStore::new(settings.store_dir()),
        )
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn available_types(&self) -> Vec<String> {
        self.registry.available_types().await
    }

    /// Configurations selectable for `repo_path`
    pub fn configs(&self, repo_path: &Path) -> Result<Vec<IsolationConfigRef>> {
        self.discovery.discover(repo_path)
    }

    pub async fn display_info(&self, config_name: &str, repo_path: &Path) -> Result<DisplayInfo> {
        let config = self.resolve(config_name, repo_path)?;
        let adapter = self.adapter(&config.backend_type)?;
        adapter.display_info(config.definition_file.as_deref()).await
    }

    fn resolve(&self, config_name: &str, repo_path: &Path) -> Result<IsolationConfigRef> {
        self.discovery
            .resolve(repo_path, config_name)?
            .ok_or_else(|| IsolationError::UnknownConfig(config_name.to_string()))
    }

    fn adapter(&self, backend_type: &str) -> Result<Arc<dyn IsolationAdapter>> {
        self.registry
            .get(backend_type)
            .ok_or_else(|| IsolationError::UnknownBackend(backend_type.to_string()))
    }

    /// Create an environment for `agent_id` from a named configuration
    pub async fn create(
        &self,
        config_name: &str,
        workspace_path: &Path,
        agent_id: &str,
        repo_path: &Path,
        session_hint: Option<&str>,
    ) -> Result<EnvironmentInfo> {
        let placeholder = EnvironmentInfo {
            handle: EnvironmentHandle::new(""),
            config_name: config_name.to_string(),
            backend_type: String::new(),
            state: EnvironmentState::Creating,
            agent_id: agent_id.to_string(),
            workspace_path: workspace_path.to_path_buf(),
            created_at: store::utc_timestamp(),
            proxy_port: None,
        };
        {
            let mut environments = self.environments.lock().await;
            if environments.contains_key(agent_id) {
                return Err(IsolationError::AlreadyExists(agent_id.to_string()));
            }
            environments.insert(agent_id.to_string(), placeholder.clone());
        }

        let span = tracing::info_span!("lifecycle.create", agent_id, config = config_name);
        let result = self
            .create_inner(placeholder, repo_path, session_hint)
            .instrument(span)
            .await;

        let mut environments = self.environments.lock().await;
        match result {
            Ok(info) => {
                environments.insert(agent_id.to_string(), info.clone());
                self.persist(&environments);
                self.update_gauge(&environments);
                drop(environments);
                self.events.emit(LifecycleEvent::Created(info.clone()));
                Ok(info)
            }
            Err(e) => {
                environments.remove(agent_id);
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        mut info: EnvironmentInfo,
        repo_path: &Path,
        session_hint: Option<&str>,
    ) -> Result<EnvironmentInfo> {
        let config = self.resolve(&info.config_name, repo_path)?;
        let backend = config.backend_type.clone();
        let start = Instant::now();

        let created = async {
            let adapter = self.adapter(&backend)?;
            if !adapter.is_available().await {
                return Err(IsolationError::Unavailable {
                    backend: backend.clone(),
                });
            }
            adapter
                .create(
                    config.definition_file.as_deref(),
                    &info.workspace_path,
                    &info.agent_id,
                    session_hint,
                )
                .await
        }
        .await;

        match created {
            Ok(created) => {
                CREATE_DURATION
                    .with_label_values(&[backend.as_str()])
                    .observe(start.elapsed().as_secs_f64());
                tracing::info!(
                    backend = %backend,
                    handle = %created.handle,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "environment created"
                );
                info.handle = created.handle;
                info.proxy_port = created.proxy_port;
                info.backend_type = backend;
                info.state = EnvironmentState::Running;
                Ok(info)
            }
            Err(e) => {
                CREATE_FAILURES.with_label_values(&[backend.as_str(), e.kind()]).inc();
                tracing::error!(backend = %backend, error = %e, "environment creation failed");
                Err(e)
            }
        }
    }

    /// Tear down the agent's environment; unknown agents are a no-op
    pub async fn destroy(&self, agent_id: &str) {
        let removed = {
            let mut environments = self.environments.lock().await;
            let removed = environments.remove(agent_id);
            if removed.is_some() {
                self.persist(&environments);
                self.update_gauge(&environments);
            }
            removed
        };
        let Some(info) = removed else {
            return;
        };

        match self.registry.get(&info.backend_type) {
            Some(adapter) => adapter.destroy(&info.handle).await,
            None => tracing::warn!(
                agent_id,
                backend = %info.backend_type,
                "no adapter for recorded backend, dropping entry only"
            ),
        }
        tracing::info!(agent_id, handle = %info.handle, "environment destroyed");
        self.events.emit(LifecycleEvent::Removed {
            agent_id: agent_id.to_string(),
        });
    }

    async fn tracked(&self, agent_id: &str) -> Result<(EnvironmentInfo, Arc<dyn IsolationAdapter>)> {
        let info = self
            .environments
            .lock()
            .await
            .get(agent_id)
            .filter(|info| info.state != EnvironmentState::Creating)
            .cloned()
            .ok_or_else(|| IsolationError::NotFound(agent_id.to_string()))?;
        let adapter = self.adapter(&info.backend_type)?;
        Ok((info, adapter))
    }

    pub async fn exec(&self, agent_id: &str, command: &str) -> Result<String> {
        let (info, adapter) = self.tracked(agent_id).await?;
        adapter.exec(&info.handle, command).await
    }

    pub async fn stats(&self, agent_id: &str) -> Result<Option<EnvironmentStats>> {
        let (info, adapter) = self.tracked(agent_id).await?;
        if !adapter.supports(Capability::Stats) {
            return Ok(None);
        }
        adapter.stats(&info.handle).await
    }

    pub async fn shell_attach_command(&self, agent_id: &str) -> Result<Option<ShellSpec>> {
        let (info, adapter) = self.tracked(agent_id).await?;
        if !adapter.supports(Capability::ShellAttach) {
            return Ok(None);
        }
        adapter
            .shell_attach_command(&info.handle, &info.workspace_path)
            .await
    }

    /// Tracked environments, sorted by agent id
    pub async fn list(&self) -> Vec<EnvironmentInfo> {
        let mut list: Vec<EnvironmentInfo> =
            self.environments.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    pub async fn get(&self, agent_id: &str) -> Option<EnvironmentInfo> {
        self.environments.lock().await.get(agent_id).cloned()
    }

    /// Reload persisted entries and re-derive their state from the backends
    ///
    /// Entries already tracked in memory are left alone.
    pub async fn restore(&self) -> Result<Vec<EnvironmentInfo>> {
        let persisted = self.store.load()?;
        let mut restored = Vec::new();

        for mut info in persisted {
            if info.state == EnvironmentState::Creating {
                tracing::warn!(agent_id = %info.agent_id, "dropping half-created entry");
                continue;
            }
            let Some(adapter) = self.registry.get(&info.backend_type) else {
                tracing::warn!(
                    agent_id = %info.agent_id,
                    backend = %info.backend_type,
                    "dropping entry for unregistered backend"
                );
                continue;
            };
            let live = if adapter.supports(Capability::LiveProbe) {
                adapter
                    .probe(&info.handle, &info.agent_id, &info.workspace_path)
                    .await
            } else {
                HandleState::Unknown
            };
            let state = match live {
                HandleState::Running => EnvironmentState::Running,
                HandleState::Stopped => EnvironmentState::Stopped,
                HandleState::Unknown => info.state,
                HandleState::Gone => {
                    tracing::info!(agent_id = %info.agent_id, handle = %info.handle, "environment gone, dropping");
                    continue;
                }
            };
            if state != info.state {
                tracing::info!(agent_id = %info.agent_id, from = %info.state, to = %state, "state re-derived");
                self.events.emit(LifecycleEvent::StateChanged {
                    agent_id: info.agent_id.clone(),
                    state,
                });
            }
            info.state = state;
            restored.push(info);
        }

        let mut environments = self.environments.lock().await;
        for info in &restored {
            environments
                .entry(info.agent_id.clone())
                .or_insert_with(|| info.clone());
        }
        self.persist(&environments);
        self.update_gauge(&environments);
        tracing::info!(count = restored.len(), "environments restored");
        Ok(restored)
    }

    /// Host environments created by this system that nothing tracks
    pub async fn find_orphaned(&self) -> Vec<OrphanedEnvironment> {
        let tracked: HashSet<(String, EnvironmentHandle)> = self
            .environments
            .lock()
            .await
            .values()
            .map(|info| (info.backend_type.clone(), info.handle.clone()))
            .collect();

        let mut orphans = Vec::new();
        for adapter in self.registry.adapters() {
            if !adapter.supports(Capability::OrphanListing) {
                continue;
            }
            let backend = adapter.backend_type();
            let managed = match adapter.list_managed().await {
                Ok(managed) => managed,
                Err(e) => {
                    tracing::warn!(backend, error = %e, "orphan listing failed");
                    continue;
                }
            };
            orphans.extend(
                managed
                    .into_iter()
                    .filter(|env| !tracked.contains(&(backend.to_string(), env.handle.clone())))
                    .map(|env| OrphanedEnvironment {
                        backend_type: backend.to_string(),
                        handle: env.handle,
                        agent_id: env.agent_id,
                        workspace_path: env.workspace_path,
                    }),
            );
        }
        orphans.sort_by(|a, b| a.handle.as_str().cmp(b.handle.as_str()));
        orphans
    }

    /// Destroy every orphan and return what was removed
    pub async fn cleanup_orphaned(&self) -> Vec<OrphanedEnvironment> {
        let orphans = self.find_orphaned().await;
        for orphan in &orphans {
            if let Some(adapter) = self.registry.get(&orphan.backend_type) {
                tracing::info!(backend = %orphan.backend_type, handle = %orphan.handle, "removing orphan");
                adapter.destroy(&orphan.handle).await;
            }
        }
        orphans
    }

    /// Sweep every backend for environments tied to `workspace_path`
    pub async fn cleanup_workspace(&self, workspace_path: &Path) {
        for adapter in self.registry.adapters() {
            if !adapter.supports(Capability::WorkspaceCleanup) {
                continue;
            }
            if let Err(e) = adapter.cleanup_by_workspace(workspace_path).await {
                tracing::warn!(
                    backend = adapter.backend_type(),
                    workspace = %workspace_path.display(),
                    error = %e,
                    "workspace cleanup failed"
                );
            }
        }

        let removed: Vec<EnvironmentInfo> = {
            let mut environments = self.environments.lock().await;
            let agents: Vec<String> = environments
                .values()
                .filter(|info| {
                    info.workspace_path == workspace_path
                        && info.state != EnvironmentState::Creating
                })
                .map(|info| info.agent_id.clone())
                .collect();
            let removed = agents
                .iter()
                .filter_map(|agent| environments.remove(agent))
                .collect::<Vec<_>>();
            if !removed.is_empty() {
                self.persist(&environments);
                self.update_gauge(&environments);
            }
            removed
        };

        for info in removed {
            // Backends without workspace cleanup still hold the handle
            if let Some(adapter) = self.registry.get(&info.backend_type) {
                if !adapter.supports(Capability::WorkspaceCleanup) {
                    adapter.destroy(&info.handle).await;
                }
            }
            self.events.emit(LifecycleEvent::Removed {
                agent_id: info.agent_id,
            });
        }
    }

    /// Destroy every tracked environment
    pub async fn shutdown(&self) {
        let agents: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|info| info.state != EnvironmentState::Creating)
            .map(|info| info.agent_id)
            .collect();
        tracing::info!(count = agents.len(), "shutting down environments");
        for agent in agents {
            self.destroy(&agent).await;
        }
    }

    fn persist(&self, environments: &HashMap<String, EnvironmentInfo>) {
        let mut entries: Vec<EnvironmentInfo> = environments
            .values()
            .filter(|info| info.state != EnvironmentState::Creating)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        if let Err(e) = self.store.save(&entries) {
            tracing::warn!(error = %e, "failed to persist environments");
        }
    }

    fn update_gauge(&self, environments: &HashMap<String, EnvironmentInfo>) {
        for backend in self.registry.types() {
            let count = environments
                .values()
                .filter(|info| info.backend_type == backend)
                .count();
            ENVIRONMENTS_ACTIVE
                .with_label_values(&[backend.as_str()])
                .set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::unisolated::UNISOLATED;

    fn manager(state: &Path) -> IsolationManager {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(UnisolatedAdapter::new()));
        IsolationManager::new(
            registry,
            Arc::new(FsConfigDiscovery::with_user_root(None)),
            EnvironmentStore::new(state),
        )
    }

    #[tokio::test]
    async fn test_unisolated_create_exec_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir.path().join("state"));
        let mut events = manager.subscribe();

        let info = manager
            .create(UNISOLATED, dir.path(), "agent-1", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(info.state, EnvironmentState::Running);
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Created(_)));

        let out = manager.exec("agent-1", "echo hi").await.unwrap();
        assert_eq!(out.trim(), "hi");
        assert_eq!(manager.stats("agent-1").await.unwrap(), None);

        let err = manager
            .create(UNISOLATED, dir.path(), "agent-1", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::AlreadyExists(_)));

        manager.destroy("agent-1").await;
        assert!(manager.get("agent-1").await.is_none());
        assert!(matches!(
            manager.exec("agent-1", "true").await,
            Err(IsolationError::NotFound(_))
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Removed {
                agent_id: "agent-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_config_leaves_no_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager
            .create("repo:nope", dir.path(), "a", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::UnknownConfig(_)));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join(".agentvisor/isolation/vm/dev.json");
        std::fs::create_dir_all(def.parent().unwrap()).unwrap();
        std::fs::write(&def, "{}").unwrap();

        let manager = manager(&dir.path().join("state"));
        let err = manager
            .create("repo:dev", dir.path(), "a", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::UnknownBackend(ref t) if t == "vm"));
        assert!(manager.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_restore_reloads_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        {
            let first = manager(&state);
            first
                .create(UNISOLATED, dir.path(), "a", dir.path(), None)
                .await
                .unwrap();
        }

        let second = manager(&state);
        let restored = second.restore().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].state, EnvironmentState::Running);
        assert_eq!(second.exec("a", "echo back").await.unwrap().trim(), "back");
    }
}
