//! Persisted environment map
//!
//! `state_dir/state/environments.json` holds one [`EnvironmentInfo`] per
//! agent. The file is a hint for `restore()`; live backend state wins.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::EnvironmentHandle;
use crate::error::{IsolationError, Result};

const STORE_FILE: &str = "environments.json";

/// Lifecycle state of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentState {
    Creating,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvironmentState::Creating => "creating",
            EnvironmentState::Running => "running",
            EnvironmentState::Stopped => "stopped",
            EnvironmentState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the lifecycle manager knows about one agent's environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub handle: EnvironmentHandle,
    pub config_name: String,
    #[serde(rename = "type")]
    pub backend_type: String,
    pub state: EnvironmentState,
    pub agent_id: String,
    pub workspace_path: PathBuf,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    environments: Vec<EnvironmentInfo>,
}

/// JSON file store with atomic replace
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    path: PathBuf,
}

impl EnvironmentStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(STORE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted entries; a missing file is an empty store
    pub fn load(&self) -> Result<Vec<EnvironmentInfo>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IsolationError::Store(format!("{}: {}", self.path.display(), e))),
        };
        let file: StoreFile = serde_json::from_str(&text)
            .map_err(|e| IsolationError::Store(format!("{}: {}", self.path.display(), e)))?;
        Ok(file.environments)
    }

    /// Replace the stored entries (temp file + rename)
    pub fn save(&self, environments: &[EnvironmentInfo]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| IsolationError::Store(format!("{}: {}", dir.display(), e)))?;
        }
        let file = StoreFile {
            environments: environments.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| IsolationError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| IsolationError::Store(format!("{}: {}", self.path.display(), e)))
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`
pub fn utc_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_rfc3339(secs)
}

fn format_rfc3339(secs: u64) -> String {
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01
/// (Howard Hinnant's `civil_from_days`)
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(agent: &str) -> EnvironmentInfo {
        EnvironmentInfo {
            handle: EnvironmentHandle::new(format!("h-{}", agent)),
            config_name: "repo:dev".to_string(),
            backend_type: "container".to_string(),
            state: EnvironmentState::Running,
            agent_id: agent.to_string(),
            workspace_path: PathBuf::from("/w"),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            proxy_port: None,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path().join("state"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_creates_dir_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path().join("state"));
        store.save(&[info("a"), info("b")]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].agent_id, "b");
        assert!(!store.path().with_extension("json.tmp").exists());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"type\": \"container\""));
        assert!(raw.contains("\"state\": \"running\""));
    }

    #[test]
    fn test_corrupt_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::new(dir.path());
        std::fs::write(store.path(), "[oops").unwrap();
        assert!(matches!(store.load(), Err(IsolationError::Store(_))));
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_rfc3339(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_rfc3339(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_rfc3339(1_700_000_000), "2023-11-14T22:13:20Z");
        assert_eq!(utc_timestamp().len(), 20);
    }
}
