//! VM definition files
//!
//! A definition is loaded once per VM and never changes afterwards. Relative
//! kernel, rootfs and mount paths are resolved against the definition file's
//! directory.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IsolationError, Result};

pub const DEFAULT_MEMORY_MB: u32 = 4096;
pub const DEFAULT_VCPUS: u32 = 2;

/// Tag and guest path of the workspace share injected into every VM
pub const WORKSPACE_TAG: &str = "workspace";
pub const WORKSPACE_GUEST_PATH: &str = "/workspace";
/// Tag and guest path of the credentials share injected into every VM
pub const CREDENTIALS_TAG: &str = "credentials";
pub const CREDENTIALS_GUEST_PATH: &str = "/mnt/credentials";

/// One virtio-fs share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtioFsMount {
    pub tag: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VirtioFsMount {
    pub fn new(
        tag: impl Into<String>,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<String>,
        read_only: bool,
    ) -> Self {
        Self {
            tag: tag.into(),
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            read_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmDefinition {
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
    pub vcpu_count: u32,
    pub run_as_root: bool,
    pub mounts: Vec<VirtioFsMount>,
    pub allowed_domains: Vec<String>,
    pub allow_all_traffic: bool,
    pub environment: BTreeMap<String, String>,
}

impl Default for VmDefinition {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            memory_mb: DEFAULT_MEMORY_MB,
            vcpu_count: DEFAULT_VCPUS,
            run_as_root: true,
            mounts: Vec::new(),
            allowed_domains: Vec::new(),
            allow_all_traffic: false,
            environment: BTreeMap::new(),
        }
    }
}

impl VmDefinition {
    /// Load and validate a definition file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.ok_or_else(|| {
            IsolationError::definition("<none>", "the vm backend requires a definition file")
        })?;
        let text =
            std::fs::read_to_string(path).map_err(|e| IsolationError::definition(path, e))?;
        let mut def: Self =
            serde_json::from_str(&text).map_err(|e| IsolationError::definition(path, e))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        def.kernel_path = resolve(base, &def.kernel_path);
        def.rootfs_path = resolve(base, &def.rootfs_path);
        for mount in &mut def.mounts {
            mount.host_path = resolve(base, &mount.host_path);
        }

        def.validate().map_err(|reason| IsolationError::definition(path, reason))?;
        Ok(def)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err("kernelPath is required".into());
        }
        if self.rootfs_path.as_os_str().is_empty() {
            return Err("rootfsPath is required".into());
        }
        if self.memory_mb == 0 || self.vcpu_count == 0 {
            return Err("memoryMB and vcpuCount must be positive".into());
        }
        let mut tags: HashSet<&str> = [WORKSPACE_TAG, CREDENTIALS_TAG].into_iter().collect();
        for mount in &self.mounts {
            if mount.tag.is_empty() || mount.tag.contains(&[',', ':', '='][..]) {
                return Err(format!("invalid mount tag '{}'", mount.tag));
            }
            if !tags.insert(mount.tag.as_str()) {
                return Err(format!("duplicate mount tag '{}'", mount.tag));
            }
        }
        Ok(())
    }

    /// All shares for one VM: workspace, credentials, then definition mounts
    pub fn all_mounts(&self, workspace: &Path, credentials: &Path) -> Vec<VirtioFsMount> {
        let mut mounts = vec![
            VirtioFsMount::new(WORKSPACE_TAG, workspace, WORKSPACE_GUEST_PATH, false),
            VirtioFsMount::new(CREDENTIALS_TAG, credentials, CREDENTIALS_GUEST_PATH, false),
        ];
        mounts.extend(self.mounts.iter().cloned());
        mounts
    }

    /// Human-readable limits for display
    pub fn limits(&self) -> Vec<String> {
        let egress = if self.allow_all_traffic {
            "egress: all domains".to_string()
        } else if self.allowed_domains.is_empty() {
            "egress: none".to_string()
        } else {
            format!("egress: {}", self.allowed_domains.join(", "))
        };
        vec![
            format!("memory {}MB", self.memory_mb),
            format!("vcpus {}", self.vcpu_count),
            egress,
        ]
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vm.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_and_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"kernelPath": "images/vmlinux", "rootfsPath": "/images/rootfs.ext4", "extra": 1}"#,
        );
        let def = VmDefinition::load(Some(&path)).unwrap();
        assert_eq!(def.memory_mb, 4096);
        assert_eq!(def.vcpu_count, 2);
        assert!(def.run_as_root);
        assert!(!def.allow_all_traffic);
        assert_eq!(def.kernel_path, dir.path().join("images/vmlinux"));
        assert_eq!(def.rootfs_path, PathBuf::from("/images/rootfs.ext4"));
    }

    #[test]
    fn test_explicit_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{"kernelPath": "/k", "rootfsPath": "/r", "memoryMB": 8192, "vcpuCount": 4,
                "runAsRoot": false, "allowedDomains": ["github.com"],
                "environment": {"EDITOR": "vi"},
                "mounts": [{"tag": "cache", "hostPath": "/var/cache/agent", "guestPath": "/cache", "readOnly": true}]}"#,
        );
        let def = VmDefinition::load(Some(&path)).unwrap();
        assert_eq!(def.memory_mb, 8192);
        assert_eq!(def.vcpu_count, 4);
        assert!(!def.run_as_root);
        assert_eq!(def.allowed_domains, vec!["github.com"]);
        assert_eq!(def.environment.get("EDITOR").map(String::as_str), Some("vi"));
        assert!(def.mounts[0].read_only);
    }

    #[test]
    fn test_reserved_and_duplicate_tags_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reserved = write(
            dir.path(),
            r#"{"kernelPath": "/k", "rootfsPath": "/r",
                "mounts": [{"tag": "workspace", "hostPath": "/x", "guestPath": "/x"}]}"#,
        );
        assert!(VmDefinition::load(Some(&reserved)).is_err());

        let dup = write(
            dir.path(),
            r#"{"kernelPath": "/k", "rootfsPath": "/r",
                "mounts": [{"tag": "a", "hostPath": "/x", "guestPath": "/x"},
                           {"tag": "a", "hostPath": "/y", "guestPath": "/y"}]}"#,
        );
        assert!(VmDefinition::load(Some(&dup)).is_err());
    }

    #[test]
    fn test_missing_kernel_or_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), r#"{"rootfsPath": "/r"}"#);
        assert!(matches!(
            VmDefinition::load(Some(&path)),
            Err(IsolationError::Definition { .. })
        ));
        assert!(VmDefinition::load(None).is_err());
    }

    #[test]
    fn test_injected_mounts_come_first() {
        let def = VmDefinition {
            mounts: vec![VirtioFsMount::new("cache", "/c", "/cache", true)],
            ..Default::default()
        };
        let mounts = def.all_mounts(Path::new("/work"), Path::new("/creds"));
        let tags: Vec<&str> = mounts.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, vec!["workspace", "credentials", "cache"]);
        assert!(!mounts[0].read_only && !mounts[1].read_only);
    }
}
