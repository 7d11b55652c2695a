//! Isolation config discovery
//!
//! Named configurations live in two places and are prefixed by origin:
//!
//! ```text
//! <repo>/.agentvisor/isolation/<type>/<name>.json         → repo:<name>
//! <config_dir>/agentvisor/isolation/<type>/<name>.json    → user:<name>
//! ```
//!
//! `unisolated` is always offered first and never read from disk.

use std::path::{Path, PathBuf};

use crate::adapter::unisolated::UNISOLATED;
use crate::error::Result;

/// A named configuration: backend type plus optional definition file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConfigRef {
    /// Prefixed name, e.g. `repo:rust-dev`
    pub name: String,
    pub backend_type: String,
    pub definition_file: Option<PathBuf>,
}

impl IsolationConfigRef {
    pub fn unisolated() -> Self {
        Self {
            name: UNISOLATED.to_string(),
            backend_type: UNISOLATED.to_string(),
            definition_file: None,
        }
    }
}

/// Resolves configuration names for a repository
pub trait ConfigDiscovery: Send + Sync {
    fn discover(&self, repo_path: &Path) -> Result<Vec<IsolationConfigRef>>;

    /// Look up one configuration by its prefixed name
    fn resolve(&self, repo_path: &Path, name: &str) -> Result<Option<IsolationConfigRef>> {
        Ok(self.discover(repo_path)?.into_iter().find(|c| c.name == name))
    }
}

/// Directory-scanning discovery
#[derive(Debug, Clone)]
pub struct FsConfigDiscovery {
    user_root: Option<PathBuf>,
}

impl FsConfigDiscovery {
    /// Use the platform config dir (`~/.config` on Linux) for user configs
    pub fn new() -> Self {
        Self {
            user_root: dirs::config_dir().map(|d| d.join("agentvisor").join("isolation")),
        }
    }

    /// Use `user_root` as the `.../agentvisor/isolation` directory
    pub fn with_user_root(user_root: Option<PathBuf>) -> Self {
        Self { user_root }
    }
}

impl Default for FsConfigDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDiscovery for FsConfigDiscovery {
    fn discover(&self, repo_path: &Path) -> Result<Vec<IsolationConfigRef>> {
        let mut configs = vec![IsolationConfigRef::unisolated()];
        scan(
            &repo_path.join(".agentvisor").join("isolation"),
            "repo",
            &mut configs,
        );
        if let Some(root) = &self.user_root {
            scan(root, "user", &mut configs);
        }
        Ok(configs)
    }
}

fn scan(root: &Path, prefix: &str, out: &mut Vec<IsolationConfigRef>) {
    let types = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %root.display(), error = %e, "no isolation configs here");
            return;
        }
    };
    let mut found = Vec::new();
    for type_dir in types.flatten() {
        let Ok(backend_type) = type_dir.file_name().into_string() else {
            continue;
        };
        if !type_dir.path().is_dir() || backend_type == UNISOLATED {
            continue;
        }
        let Ok(files) = std::fs::read_dir(type_dir.path()) else {
            tracing::debug!(dir = %type_dir.path().display(), "unreadable isolation type directory");
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            found.push(IsolationConfigRef {
                name: format!("{}:{}", prefix, stem),
                backend_type: backend_type.clone(),
                definition_file: Some(path.clone()),
            });
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    out.extend(found);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "{}").unwrap();
    }

    #[test]
    fn test_unisolated_always_first() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = FsConfigDiscovery::with_user_root(None);
        let configs = discovery.discover(dir.path()).unwrap();
        assert_eq!(configs, vec![IsolationConfigRef::unisolated()]);
    }

    #[test]
    fn test_repo_and_user_configs_are_prefixed() {
        let repo = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        touch(&repo.path().join(".agentvisor/isolation/vm/dev.json"));
        touch(&repo.path().join(".agentvisor/isolation/container/node.json"));
        touch(&repo.path().join(".agentvisor/isolation/container/README.md"));
        touch(&repo.path().join(".agentvisor/isolation/unisolated/ignored.json"));
        touch(&user.path().join("vm/big.json"));

        let discovery = FsConfigDiscovery::with_user_root(Some(user.path().to_path_buf()));
        let configs = discovery.discover(repo.path()).unwrap();
        let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["unisolated", "repo:dev", "repo:node", "user:big"]);

        let dev = discovery.resolve(repo.path(), "repo:dev").unwrap().unwrap();
        assert_eq!(dev.backend_type, "vm");
        assert_eq!(
            dev.definition_file,
            Some(repo.path().join(".agentvisor/isolation/vm/dev.json"))
        );
        assert!(discovery.resolve(repo.path(), "repo:missing").unwrap().is_none());
    }
}
